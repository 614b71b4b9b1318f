// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The capability interface the firmware-update orchestrator calls into to
//! enumerate and stream firmware data, independent of the on-disk format.
//!
//! This plays the same role for file formats that `Validate`/`VoltageSensor`
//! play for PMBus devices: generic driver logic is written once against the
//! trait, and a concrete reader (the S-record reader, say) plugs in behind
//! it.

#![cfg_attr(not(test), no_std)]

/// A maximal contiguous run of firmware bytes destined for a contiguous
/// target memory range.
///
/// The `locator` lets a reader reopen this segment for sequential streaming
/// without needing to re-scan the file; its meaning is private to the
/// concrete reader.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FirmwareSegment {
    pub base_address: u32,
    pub length: u32,
    pub locator: SegmentLocator,
}

/// Opaque bookkeeping a reader uses to reopen a segment.
///
/// For the S-record reader this is a byte offset to the first line
/// contributing to the segment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SegmentLocator(pub u32);

/// Failures a firmware reader can report while opening or streaming a file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileError {
    FileNotFound,
    IoError,
    BadChecksum,
    BadByteCount,
    SegmentOverlap,
    OutOfMemory,
    NoSuchSegment,
    NotOpen,
}

/// The capability set a concrete firmware file reader exposes.
///
/// Implementors own their own segment storage and cursor state; the
/// orchestrator never reaches past this trait to touch file internals.
pub trait FirmwareReader {
    /// Opens `path`, parsing it fully and building the segment set.
    ///
    /// On any parse failure the reader is left in the not-open state and
    /// no segments are observable.
    fn open(&mut self, path: &str) -> Result<(), FileError>;

    /// Releases any resources associated with the currently open file.
    /// A no-op if no file is open.
    fn close(&mut self);

    /// Number of segments in the currently open file.
    fn segment_count(&self) -> u8;

    /// `(base_address, length)` of segment `idx`.
    fn segment_info(&self, idx: u8) -> Result<(u32, u32), FileError>;

    /// Positions the streaming cursor at the start of segment `idx`,
    /// invalidating any previously opened cursor.
    fn segment_open(&mut self, idx: u8) -> Result<(), FileError>;

    /// Pulls the next contiguous chunk from the currently open segment
    /// cursor. `Ok(None)` signals end of segment.
    ///
    /// Each returned chunk is contiguous with the previous one:
    /// `chunk[k].address + chunk[k].length == chunk[k + 1].address`. Chunk
    /// size is reader-defined but never zero except for the sentinel that
    /// ends the segment.
    fn segment_next_data(
        &mut self,
    ) -> Result<Option<(u32, u16, &[u8])>, FileError>;
}
