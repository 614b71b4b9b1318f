// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The firmware-update orchestrator: sequences "open file, connect with
//! retry, erase every segment, program every segment, reset, close" with
//! well-defined failure propagation on every exit path.
//!
//! Consolidates the reader, the session, and (transitively, through the
//! session) the port into one value owned by the embedding application --
//! the re-architecture this crate takes on the original's global
//! `readerPtr`/`protocolPtr`/`portInterface` module statics, per this
//! crate's design notes. A global singleton built from the same pieces
//! remains an option for callers that want one; it is not required here.

#![cfg_attr(not(test), no_std)]

pub use drv_firmware_reader_api::FileError;
pub use drv_xcp_session_api::{ProtocolId, SessionError, XcpSettings};

use drv_firmware_reader_api::FirmwareReader;
use drv_srec_reader::{FileSource, SrecReader};
use drv_xcp_loader::XcpLoader;
use drv_xcp_port::PortInterface;
use drv_xcp_session_api::SessionProtocol;
use ringbuf::{ringbuf, ringbuf_entry};

/// Segment storage capacity used by [`new_srec_xcp_library`]'s concrete
/// reader. Embedders who need a different bound can build their own
/// `SrecReader<_, N>` directly and pass it to [`Library::new`] instead.
pub const MAX_SEGMENTS: usize = 32;

/// The concrete pairing most embedders want: an S-record reader over their
/// filesystem, talking XCP 1.0 over their transport.
pub type SrecXcpLibrary<Src, P> = Library<SrecReader<Src, MAX_SEGMENTS>, XcpLoader<P>>;

/// Wires together the S-record reader and the XCP 1.0 loader the same way
/// a Hubris task's `main` wires a concrete device driver to its I2C handle.
pub fn new_srec_xcp_library<Src: FileSource, P: PortInterface>(
    file_source: Src,
    port: P,
) -> SrecXcpLibrary<Src, P> {
    Library::new(SrecReader::new(file_source), XcpLoader::new(port))
}

/// Which concrete firmware file format the reader half of the [`Library`]
/// speaks. Only S-record exists today; the variant exists so
/// `firmware_init` has a stable signature if a second format is added.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReaderKind {
    SRecord,
}

/// The orchestrator's own failure, for the one step (post-update cleanup)
/// that isn't simply a reader or session error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpdateError {
    File(FileError),
    Session(SessionError),
    Unsupported,
    Aborted,
}

impl From<FileError> for UpdateError {
    fn from(e: FileError) -> Self {
        UpdateError::File(e)
    }
}

impl From<SessionError> for UpdateError {
    fn from(e: SessionError) -> Self {
        UpdateError::Session(e)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Start,
    Opened,
    OpenFailed(FileError),
    Connected,
    ConnectFailed(SessionError),
    ClearingSegment(u8, u32, u32),
    ClearFailed(u8, SessionError),
    WritingSegment(u8),
    WriteFailed(u8, SessionError),
    UpdateSucceeded,
    UpdateFailed,
}

ringbuf!(Trace, 32, Trace::None);

/// A callback the embedder may install at [`Library::new`] time to observe
/// otherwise-silent failures. Absent, every failure simply propagates as an
/// ordinary `Result`; the core never loops forever or halts on its own.
pub type FatalHook = fn(&str);

/// The single value an embedding application owns to drive a firmware
/// update: a firmware reader, a session protocol engine (which in turn owns
/// the port), and an optional diagnostic hook.
pub struct Library<R: FirmwareReader, S: SessionProtocol> {
    reader: R,
    reader_kind: ReaderKind,
    session: S,
    fatal_hook: Option<FatalHook>,
}

impl<R: FirmwareReader, S: SessionProtocol> Library<R, S> {
    pub fn new(reader: R, session: S) -> Self {
        Self {
            reader,
            reader_kind: ReaderKind::SRecord,
            session,
            fatal_hook: None,
        }
    }

    fn fail(&self, msg: &str) {
        if let Some(hook) = self.fatal_hook {
            hook(msg);
        }
    }

    // -- Public API surface ------------------------------------------------

    pub fn firmware_init(&mut self, reader: ReaderKind) -> Result<(), UpdateError> {
        if reader != ReaderKind::SRecord {
            return Err(UpdateError::Unsupported);
        }
        self.reader_kind = reader;
        Ok(())
    }

    pub fn firmware_terminate(&mut self) {
        self.reader.close();
    }

    pub fn firmware_file_open(&mut self, path: &str) -> Result<(), FileError> {
        self.reader.open(path)
    }

    pub fn firmware_file_close(&mut self) {
        self.reader.close();
    }

    pub fn firmware_segment_count(&self) -> u8 {
        self.reader.segment_count()
    }

    pub fn firmware_segment_info(&self, idx: u8) -> Result<(u32, u32), FileError> {
        self.reader.segment_info(idx)
    }

    pub fn firmware_segment_open(&mut self, idx: u8) -> Result<(), FileError> {
        self.reader.segment_open(idx)
    }

    pub fn firmware_segment_next_data(
        &mut self,
    ) -> Result<Option<(u32, u16, &[u8])>, FileError> {
        self.reader.segment_next_data()
    }

    pub fn session_init(
        &mut self,
        protocol: ProtocolId,
        settings: &XcpSettings,
    ) -> Result<(), SessionError> {
        match protocol {
            ProtocolId::XcpV10 => self.session.init(settings),
        }
    }

    pub fn session_terminate(&mut self) {
        self.session.terminate();
    }

    pub fn session_start(&mut self) -> Result<(), SessionError> {
        self.session.start()
    }

    pub fn session_stop(&mut self) -> Result<(), SessionError> {
        self.session.stop()
    }

    pub fn session_clear_memory(&mut self, addr: u32, len: u32) -> Result<(), SessionError> {
        self.session.clear_memory(addr, len)
    }

    pub fn session_write_data(&mut self, addr: u32, data: &[u8]) -> Result<(), SessionError> {
        self.session.write_data(addr, data)
    }

    pub fn session_read_data(
        &mut self,
        addr: u32,
        len: u32,
        out: &mut [u8],
    ) -> Result<(), SessionError> {
        self.session.read_data(addr, len, out)
    }

    /// The single composed entry point: open the firmware file, connect,
    /// erase and program every segment, reset the target, and release every
    /// resource acquired along the way -- on every exit path, including a
    /// parse error or a protocol error mid-update.
    pub fn update_firmware(&mut self, path: &str, node_id: u8) -> Result<(), UpdateError> {
        ringbuf_entry!(Trace::Start);

        let settings = XcpSettings {
            connect_mode: node_id,
            ..XcpSettings::default()
        };

        let result = self.run_update(path, &settings);

        // Every resource acquired by `run_update` is released here,
        // regardless of which step failed.
        let _ = self.session.stop();
        self.reader.close();
        self.session.terminate();

        match &result {
            Ok(()) => ringbuf_entry!(Trace::UpdateSucceeded),
            Err(_) => {
                ringbuf_entry!(Trace::UpdateFailed);
                self.fail("firmware update failed");
            }
        }

        result
    }

    fn run_update(
        &mut self,
        path: &str,
        settings: &XcpSettings,
    ) -> Result<(), UpdateError> {
        self.session_init(ProtocolId::XcpV10, settings)?;

        if let Err(e) = self.reader.open(path) {
            ringbuf_entry!(Trace::OpenFailed(e));
            return Err(e.into());
        }
        ringbuf_entry!(Trace::Opened);

        // `session.start()` performs its own bounded CONNECT retries
        // (the loader allows 5 attempts, each with its own timeout); the
        // orchestrator itself does not impose a second deadline on top.
        if let Err(e) = self.session.start() {
            ringbuf_entry!(Trace::ConnectFailed(e));
            return Err(e.into());
        }
        ringbuf_entry!(Trace::Connected);

        let segment_count = self.reader.segment_count();
        for idx in 0..segment_count {
            let (base, len) = self.reader.segment_info(idx)?;
            ringbuf_entry!(Trace::ClearingSegment(idx, base, len));
            if let Err(e) = self.session.clear_memory(base, len) {
                ringbuf_entry!(Trace::ClearFailed(idx, e));
                return Err(e.into());
            }
        }

        for idx in 0..segment_count {
            ringbuf_entry!(Trace::WritingSegment(idx));
            self.reader.segment_open(idx)?;
            loop {
                match self.reader.segment_next_data()? {
                    None => break,
                    Some((addr, len, data)) => {
                        if len == 0 {
                            continue;
                        }
                        if let Err(e) = self.session.write_data(addr, data) {
                            ringbuf_entry!(Trace::WriteFailed(idx, e));
                            return Err(e.into());
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec as StdVec;

    struct FakeReader {
        open: bool,
        segments: StdVec<(u32, u32)>,
        cursor: Option<(usize, u32, u32)>,
        open_calls: StdVec<StdVec<u8>>,
    }

    impl FakeReader {
        fn new(segments: StdVec<(u32, u32)>) -> Self {
            Self {
                open: false,
                segments,
                cursor: None,
                open_calls: StdVec::new(),
            }
        }
    }

    impl FirmwareReader for FakeReader {
        fn open(&mut self, path: &str) -> Result<(), FileError> {
            self.open = true;
            self.open_calls.push(path.as_bytes().to_vec());
            Ok(())
        }

        fn close(&mut self) {
            self.open = false;
            self.cursor = None;
        }

        fn segment_count(&self) -> u8 {
            self.segments.len() as u8
        }

        fn segment_info(&self, idx: u8) -> Result<(u32, u32), FileError> {
            self.segments
                .get(idx as usize)
                .copied()
                .ok_or(FileError::NoSuchSegment)
        }

        fn segment_open(&mut self, idx: u8) -> Result<(), FileError> {
            let (base, len) = self.segment_info(idx)?;
            self.cursor = Some((idx as usize, base, len));
            Ok(())
        }

        fn segment_next_data(&mut self) -> Result<Option<(u32, u16, &[u8])>, FileError> {
            static CHUNK: [u8; 4] = [0xAA, 0xBB, 0xCC, 0xDD];
            match self.cursor {
                None => Err(FileError::NoSuchSegment),
                Some((_, _base, 0)) => Ok(None),
                Some((idx, base, remaining)) => {
                    let n = remaining.min(4);
                    self.cursor = Some((idx, base + n, remaining - n));
                    Ok(Some((base, n as u16, &CHUNK[..n as usize])))
                }
            }
        }
    }

    #[derive(Default)]
    struct FakeSession {
        connected: bool,
        started: bool,
        stopped: bool,
        cleared: StdVec<(u32, u32)>,
        written: StdVec<(u32, StdVec<u8>)>,
        fail_clear_for: Option<u32>,
    }

    impl SessionProtocol for FakeSession {
        fn init(&mut self, _settings: &XcpSettings) -> Result<(), SessionError> {
            Ok(())
        }

        fn terminate(&mut self) {
            self.connected = false;
        }

        fn start(&mut self) -> Result<(), SessionError> {
            self.started = true;
            self.connected = true;
            Ok(())
        }

        fn stop(&mut self) -> Result<(), SessionError> {
            self.stopped = true;
            self.connected = false;
            Ok(())
        }

        fn clear_memory(&mut self, addr: u32, len: u32) -> Result<(), SessionError> {
            if self.fail_clear_for == Some(addr) {
                return Err(SessionError::Timeout);
            }
            self.cleared.push((addr, len));
            Ok(())
        }

        fn write_data(&mut self, addr: u32, data: &[u8]) -> Result<(), SessionError> {
            self.written.push((addr, data.to_vec()));
            Ok(())
        }

        fn read_data(
            &mut self,
            _addr: u32,
            _len: u32,
            _out: &mut [u8],
        ) -> Result<(), SessionError> {
            Err(SessionError::NotImplemented)
        }
    }

    #[test]
    fn full_update_sequence_clears_and_writes_every_segment() {
        let reader = FakeReader::new(vec![(0x0000, 6), (0x0100, 4)]);
        let session = FakeSession::default();
        let mut lib = Library::new(reader, session);

        lib.update_firmware("firmware.s19", 0x42).unwrap();

        assert_eq!(lib.session.cleared, vec![(0x0000, 6), (0x0100, 4)]);
        assert_eq!(lib.session.written.len(), 3); // 4+2, then 4 bytes
        assert!(lib.session.started);
        assert!(lib.session.stopped);
        assert!(!lib.reader.open);
    }

    #[test]
    fn failed_clear_still_releases_every_resource() {
        let reader = FakeReader::new(vec![(0x0000, 6), (0x0100, 4)]);
        let mut session = FakeSession::default();
        session.fail_clear_for = Some(0x0100);
        let mut lib = Library::new(reader, session);

        let result = lib.update_firmware("firmware.s19", 0);

        assert_eq!(result, Err(UpdateError::Session(SessionError::Timeout)));
        assert!(lib.session.stopped);
        assert!(!lib.reader.open);
        assert_eq!(lib.session.cleared, vec![(0x0000, 6)]);
    }

    #[test]
    fn open_failure_never_reaches_connect() {
        struct AlwaysFailsOpen(FakeReader);
        impl FirmwareReader for AlwaysFailsOpen {
            fn open(&mut self, _path: &str) -> Result<(), FileError> {
                Err(FileError::FileNotFound)
            }
            fn close(&mut self) {
                self.0.close();
            }
            fn segment_count(&self) -> u8 {
                self.0.segment_count()
            }
            fn segment_info(&self, idx: u8) -> Result<(u32, u32), FileError> {
                self.0.segment_info(idx)
            }
            fn segment_open(&mut self, idx: u8) -> Result<(), FileError> {
                self.0.segment_open(idx)
            }
            fn segment_next_data(&mut self) -> Result<Option<(u32, u16, &[u8])>, FileError> {
                self.0.segment_next_data()
            }
        }

        let reader = AlwaysFailsOpen(FakeReader::new(vec![]));
        let session = FakeSession::default();
        let mut lib = Library::new(reader, session);

        let result = lib.update_firmware("missing.s19", 0);
        assert_eq!(result, Err(UpdateError::File(FileError::FileNotFound)));
        assert!(!lib.session.started);
    }
}
