// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dispatch layer that binds a chosen calibration/measurement protocol
//! implementation to the stable method names the orchestrator calls,
//! independent of which protocol version or variant is underneath.
//!
//! This draws the same line the teacher draws between `drv-i2c-api` (a
//! stable client surface) and the concrete device drivers behind it: the
//! orchestrator links against [`SessionProtocol`], never against a specific
//! protocol engine.

#![cfg_attr(not(test), no_std)]

/// Identifies which concrete protocol a session should speak.
///
/// Only one variant exists today; this is an enum rather than a bare
/// constant so adding a protocol later doesn't change the `session_init`
/// signature.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProtocolId {
    XcpV10,
}

/// Timeout classes and connection parameters recognized by the protocol
/// engine. Units are all milliseconds unless noted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct XcpSettings {
    /// Generic command-response timeout.
    pub t1: u32,
    /// PROGRAM_START response timeout.
    pub t3: u32,
    /// PROGRAM_CLEAR (erase) response timeout.
    pub t4: u32,
    /// PROGRAM / PROGRAM_RESET response timeout.
    pub t5: u32,
    /// CONNECT response timeout.
    pub t6: u32,
    /// Busy-wait timeout for status polling.
    pub t7: u32,
    /// Byte placed in the CONNECT command; used as a node id on
    /// multi-drop transports.
    pub connect_mode: u8,
}

impl Default for XcpSettings {
    fn default() -> Self {
        Self {
            t1: 100,
            t3: 2_500,
            t4: 2_500,
            t5: 2_500,
            t6: 500,
            t7: 1_000,
            connect_mode: 0,
        }
    }
}

/// Failures a session-level call can report.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionError {
    Unsupported,
    ConnectFailed,
    Timeout,
    ProtocolViolation,
    ResourceLocked,
    PacketTooLarge,
    PortUnavailable,
    NotImplemented,
    NotConnected,
}

/// The capability set the firmware-update orchestrator drives, independent
/// of which protocol implements it.
///
/// Object-safe so the orchestrator can hold a `&dyn SessionProtocol`
/// exactly as the teacher's session facade holds a borrowed
/// function-pointer table.
pub trait SessionProtocol {
    fn init(&mut self, settings: &XcpSettings) -> Result<(), SessionError>;
    fn terminate(&mut self);

    /// Connects to the target, retrying the handshake per the protocol's
    /// own retry policy.
    fn start(&mut self) -> Result<(), SessionError>;

    /// Ends programming mode (if active) and resets the target. A session
    /// that is already disconnected treats this as a no-op success.
    fn stop(&mut self) -> Result<(), SessionError>;

    fn clear_memory(&mut self, addr: u32, len: u32) -> Result<(), SessionError>;

    fn write_data(&mut self, addr: u32, data: &[u8]) -> Result<(), SessionError>;

    /// Declared for completeness; concrete protocols may return
    /// `SessionError::NotImplemented`.
    fn read_data(
        &mut self,
        addr: u32,
        len: u32,
        out: &mut [u8],
    ) -> Result<(), SessionError>;
}
