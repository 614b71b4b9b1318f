// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The concrete [`FirmwareReader`] for Motorola S-record files: parses
//! S1/S2/S3 lines with checksum validation, coalesces adjacent records into
//! segments, and serves sequential reads from any segment.
//!
//! The filesystem itself is an out-of-scope collaborator: this crate never
//! touches a FAT implementation or an SD card directly. Instead it's handed
//! a narrow [`FileSource`] capability, the same way `drv-i2c-api` hands
//! device code an `I2cDevice` rather than a raw peripheral.

#![cfg_attr(not(test), no_std)]

use drv_firmware_reader_api::{FileError, FirmwareReader, FirmwareSegment, SegmentLocator};
use ringbuf::{ringbuf, ringbuf_entry};

/// Upper bound on the data bytes carried by a single S-record line
/// (`byte_count` is a single hex-encoded byte, so at most 255 total, less
/// address bytes and the checksum byte).
pub const MAX_LINE_DATA: usize = 252;

/// A line-oriented byte source handed to the reader by the embedding
/// application, abstracting over whatever filesystem backs the firmware
/// file.
pub trait FileSource {
    fn open(&mut self, path: &str) -> Result<(), FileError>;
    fn close(&mut self);

    /// Fills `buf` with the next line's bytes, excluding any line
    /// terminator. Returns the byte offset of the start of the line and the
    /// number of bytes written; `Ok((_, 0))` signals end of file.
    fn read_line(&mut self, buf: &mut [u8]) -> Result<(u32, usize), FileError>;

    /// Repositions the source so the next [`read_line`](Self::read_line)
    /// returns the line starting at `offset`.
    fn seek(&mut self, offset: u32) -> Result<(), FileError>;
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Opened,
    OpenFailed(FileError),
    SegmentCount(u8),
    ChecksumMismatch(u32),
    Closed,
}

ringbuf!(Trace, 16, Trace::None);

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn hex_byte(hi: u8, lo: u8) -> Option<u8> {
    Some((hex_nibble(hi)? << 4) | hex_nibble(lo)?)
}

/// One decoded S-record data line.
struct DataLine {
    base: u32,
    data: heapless::Vec<u8, MAX_LINE_DATA>,
}

/// Decodes a single line of the file. `Ok(None)` means the line was
/// recognized but contributes no data (S0, S4-S9, or a line that doesn't
/// begin with `S`/`s`).
fn parse_line(line: &[u8]) -> Result<Option<DataLine>, FileError> {
    if line.len() < 2 || (line[0] != b'S' && line[0] != b's') {
        return Ok(None);
    }
    let addr_len = match line[1] {
        b'1' => 2,
        b'2' => 3,
        b'3' => 4,
        _ => return Ok(None),
    };

    // header(S+type) + byte-count hex pair + (addr_len + data + checksum) hex pairs
    if line.len() < 4 {
        return Err(FileError::BadByteCount);
    }
    let byte_count = hex_byte(line[2], line[3]).ok_or(FileError::BadByteCount)?;
    let min_count = addr_len + 1;
    if (byte_count as usize) <= min_count {
        return Err(FileError::BadByteCount);
    }
    let data_len = byte_count as usize - min_count;

    let expected_hex_len = 4 + (byte_count as usize) * 2;
    if line.len() < expected_hex_len {
        return Err(FileError::BadByteCount);
    }

    let mut sum: u8 = byte_count;
    let mut cursor = 4;

    let mut base: u32 = 0;
    for _ in 0..addr_len {
        let b = hex_byte(line[cursor], line[cursor + 1]).ok_or(FileError::BadChecksum)?;
        base = (base << 8) | b as u32;
        sum = sum.wrapping_add(b);
        cursor += 2;
    }

    let mut data = heapless::Vec::<u8, MAX_LINE_DATA>::new();
    for _ in 0..data_len {
        let b = hex_byte(line[cursor], line[cursor + 1]).ok_or(FileError::BadChecksum)?;
        sum = sum.wrapping_add(b);
        data.push(b).map_err(|_| FileError::OutOfMemory)?;
        cursor += 2;
    }

    let checksum = hex_byte(line[cursor], line[cursor + 1]).ok_or(FileError::BadChecksum)?;
    if !sum != checksum {
        return Err(FileError::BadChecksum);
    }

    Ok(Some(DataLine { base, data }))
}

/// The concrete S-record [`FirmwareReader`], parameterized on the maximum
/// number of segments it can hold and the file source it reads through.
pub struct SrecReader<S: FileSource, const MAX_SEGMENTS: usize> {
    source: S,
    is_open: bool,
    segments: heapless::Vec<FirmwareSegment, MAX_SEGMENTS>,
    max_line_data: usize,

    // Streaming cursor state for the currently-open segment, if any.
    cursor_segment: Option<usize>,
    cursor_next_addr: u32,
    cursor_remaining: u32,
    scratch: [u8; MAX_LINE_DATA],
}

impl<S: FileSource, const MAX_SEGMENTS: usize> SrecReader<S, MAX_SEGMENTS> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            is_open: false,
            segments: heapless::Vec::new(),
            max_line_data: 0,
            cursor_segment: None,
            cursor_next_addr: 0,
            cursor_remaining: 0,
            scratch: [0; MAX_LINE_DATA],
        }
    }

    fn push_or_extend(&mut self, offset: u32, line: DataLine) -> Result<(), FileError> {
        self.max_line_data = self.max_line_data.max(line.data.len());

        if let Some(last) = self.segments.last_mut() {
            if line.base == last.base_address + last.length {
                last.length += line.data.len() as u32;
                return Ok(());
            }
        }

        self.segments
            .push(FirmwareSegment {
                base_address: line.base,
                length: line.data.len() as u32,
                locator: SegmentLocator(offset),
            })
            .map_err(|_| FileError::OutOfMemory)
    }

    fn sort_and_validate(&mut self) -> Result<(), FileError> {
        // Insertion sort: segment counts are small and heapless has no
        // generic sort_unstable_by for arbitrary backing storage here.
        for i in 1..self.segments.len() {
            let mut j = i;
            while j > 0 && self.segments[j].base_address < self.segments[j - 1].base_address {
                self.segments.swap(j, j - 1);
                j -= 1;
            }
        }

        for i in 1..self.segments.len() {
            let prev = self.segments[i - 1];
            let cur = self.segments[i];
            if cur.base_address < prev.base_address + prev.length {
                return Err(FileError::SegmentOverlap);
            }
        }
        Ok(())
    }
}

impl<S: FileSource, const MAX_SEGMENTS: usize> FirmwareReader for SrecReader<S, MAX_SEGMENTS> {
    fn open(&mut self, path: &str) -> Result<(), FileError> {
        self.segments.clear();
        self.max_line_data = 0;
        self.cursor_segment = None;

        if let Err(e) = self.source.open(path) {
            ringbuf_entry!(Trace::OpenFailed(e));
            return Err(e);
        }

        let result = (|| {
            let mut buf = [0u8; 4 + 255 * 2];
            loop {
                let (offset, len) = self.source.read_line(&mut buf)?;
                if len == 0 {
                    break;
                }
                let mut line = &buf[..len];
                while line.last() == Some(&b'\r') || line.last() == Some(&b'\n') {
                    line = &line[..line.len() - 1];
                }
                if let Some(data_line) = parse_line(line)? {
                    self.push_or_extend(offset, data_line)?;
                }
            }
            self.sort_and_validate()
        })();

        match result {
            Ok(()) => {
                self.is_open = true;
                ringbuf_entry!(Trace::Opened);
                ringbuf_entry!(Trace::SegmentCount(self.segments.len() as u8));
                Ok(())
            }
            Err(e) => {
                if matches!(e, FileError::BadChecksum) {
                    ringbuf_entry!(Trace::ChecksumMismatch(0));
                }
                self.segments.clear();
                self.source.close();
                self.is_open = false;
                Err(e)
            }
        }
    }

    fn close(&mut self) {
        if self.is_open {
            self.source.close();
            self.is_open = false;
            self.segments.clear();
            self.cursor_segment = None;
            ringbuf_entry!(Trace::Closed);
        }
    }

    fn segment_count(&self) -> u8 {
        self.segments.len() as u8
    }

    fn segment_info(&self, idx: u8) -> Result<(u32, u32), FileError> {
        if !self.is_open {
            return Err(FileError::NotOpen);
        }
        let seg = self
            .segments
            .get(idx as usize)
            .ok_or(FileError::NoSuchSegment)?;
        Ok((seg.base_address, seg.length))
    }

    fn segment_open(&mut self, idx: u8) -> Result<(), FileError> {
        if !self.is_open {
            return Err(FileError::NotOpen);
        }
        let seg = *self
            .segments
            .get(idx as usize)
            .ok_or(FileError::NoSuchSegment)?;
        self.source.seek(seg.locator.0)?;
        self.cursor_segment = Some(idx as usize);
        self.cursor_next_addr = seg.base_address;
        self.cursor_remaining = seg.length;
        Ok(())
    }

    fn segment_next_data(&mut self) -> Result<Option<(u32, u16, &[u8])>, FileError> {
        if !self.is_open {
            return Err(FileError::NotOpen);
        }
        if self.cursor_segment.is_none() {
            return Err(FileError::NoSuchSegment);
        }
        if self.cursor_remaining == 0 {
            return Ok(None);
        }

        let mut buf = [0u8; 4 + 255 * 2];
        loop {
            let (_, len) = self.source.read_line(&mut buf)?;
            if len == 0 {
                return Err(FileError::IoError);
            }
            let mut line = &buf[..len];
            while line.last() == Some(&b'\r') || line.last() == Some(&b'\n') {
                line = &line[..line.len() - 1];
            }
            let Some(data_line) = parse_line(line)? else {
                continue;
            };
            if data_line.base != self.cursor_next_addr {
                return Err(FileError::SegmentOverlap);
            }

            let n = data_line.data.len();
            self.scratch[..n].copy_from_slice(&data_line.data);
            self.cursor_next_addr += n as u32;
            self.cursor_remaining -= n as u32;

            let addr = data_line.base;
            return Ok(Some((addr, n as u16, &self.scratch[..n])));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec as StdVec;

    struct FakeSource {
        lines: StdVec<(u32, StdVec<u8>)>,
        pos: usize,
        opened: bool,
    }

    impl FakeSource {
        fn new(text: &str) -> Self {
            let mut lines = StdVec::new();
            let mut offset = 0u32;
            for raw in text.split_inclusive('\n') {
                let trimmed = raw.trim_end_matches(['\r', '\n']);
                lines.push((offset, trimmed.as_bytes().to_vec()));
                offset += raw.len() as u32;
            }
            Self {
                lines,
                pos: 0,
                opened: false,
            }
        }
    }

    impl FileSource for FakeSource {
        fn open(&mut self, _path: &str) -> Result<(), FileError> {
            self.opened = true;
            self.pos = 0;
            Ok(())
        }

        fn close(&mut self) {
            self.opened = false;
        }

        fn read_line(&mut self, buf: &mut [u8]) -> Result<(u32, usize), FileError> {
            if self.pos >= self.lines.len() {
                return Ok((0, 0));
            }
            let (offset, ref bytes) = self.lines[self.pos];
            self.pos += 1;
            buf[..bytes.len()].copy_from_slice(bytes);
            Ok((offset, bytes.len()))
        }

        fn seek(&mut self, offset: u32) -> Result<(), FileError> {
            self.pos = self
                .lines
                .iter()
                .position(|(o, _)| *o == offset)
                .ok_or(FileError::IoError)?;
            Ok(())
        }
    }

    fn drain_segment<S: FileSource, const N: usize>(
        reader: &mut SrecReader<S, N>,
        idx: u8,
    ) -> StdVec<u8> {
        reader.segment_open(idx).unwrap();
        let mut out = StdVec::new();
        while let Some((_, len, data)) = reader.segment_next_data().unwrap() {
            out.extend_from_slice(&data[..len as usize]);
        }
        out
    }

    #[test]
    fn minimal_file_single_segment() {
        let src = FakeSource::new("S10A001001020304050607C9\r\n");
        let mut reader = SrecReader::<_, 8>::new(src);
        reader.open("firmware.s19").unwrap();
        assert_eq!(reader.segment_count(), 1);
        assert_eq!(reader.segment_info(0).unwrap(), (0x0010, 7));
        assert_eq!(
            drain_segment(&mut reader, 0),
            vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]
        );
    }

    #[test]
    fn two_coalesced_lines_form_one_segment() {
        let src =
            FakeSource::new("S1060000010203F3\nS1060003010203F0\n");
        let mut reader = SrecReader::<_, 8>::new(src);
        reader.open("firmware.s19").unwrap();
        assert_eq!(reader.segment_count(), 1);
        assert_eq!(reader.segment_info(0).unwrap(), (0x0000, 6));
    }

    #[test]
    fn gap_produces_two_segments() {
        let src =
            FakeSource::new("S1060000010203F3\nS1060100010203F2\n");
        let mut reader = SrecReader::<_, 8>::new(src);
        reader.open("firmware.s19").unwrap();
        assert_eq!(reader.segment_count(), 2);
        assert_eq!(reader.segment_info(0).unwrap(), (0x0000, 3));
        assert_eq!(reader.segment_info(1).unwrap(), (0x0100, 3));
    }

    #[test]
    fn bad_checksum_rejects_file() {
        let src = FakeSource::new("S10A0010010203040506070800\r\n");
        let mut reader = SrecReader::<_, 8>::new(src);
        assert_eq!(reader.open("firmware.s19"), Err(FileError::BadChecksum));
        assert_eq!(reader.segment_count(), 0);
    }

    #[test]
    fn unrecognized_record_types_are_ignored() {
        let src = FakeSource::new(
            "S0030000FC\nS10A001001020304050607C9\r\nS9030000FC\n",
        );
        let mut reader = SrecReader::<_, 8>::new(src);
        reader.open("firmware.s19").unwrap();
        assert_eq!(reader.segment_count(), 1);
    }

    #[test]
    fn reopening_a_segment_yields_identical_bytes() {
        let src = FakeSource::new("S10A001001020304050607C9\r\n");
        let mut reader = SrecReader::<_, 8>::new(src);
        reader.open("firmware.s19").unwrap();
        let first = drain_segment(&mut reader, 0);
        let second = drain_segment(&mut reader, 0);
        assert_eq!(first, second);
    }
}
