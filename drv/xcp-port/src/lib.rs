// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The capability interface a host application hands to the XCP core in
//! place of a raw transport handle: a clock, a non-blocking packet receive,
//! a packet transmit, and an optional seed-to-key transform.

#![cfg_attr(not(test), no_std)]

/// Compile-time ceiling on the size of a single XCP packet (CTO or DTO).
///
/// The reference CAN embedding uses 8; the XCP 1.0 wire format caps any
/// single packet at 255 regardless of transport.
pub const MAX_PACKET_LEN: usize = 255;

/// A fixed-capacity byte buffer carrying one XCP command or response packet.
///
/// There is no length prefix in the buffer itself; `len` is the only source
/// of truth for how many of `data`'s bytes are valid.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct XcpPacket {
    data: [u8; MAX_PACKET_LEN],
    len: usize,
}

impl Default for XcpPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl XcpPacket {
    pub const fn new() -> Self {
        Self {
            data: [0; MAX_PACKET_LEN],
            len: 0,
        }
    }

    /// Builds a packet from a byte slice.
    ///
    /// Returns `None` if `bytes` is longer than [`MAX_PACKET_LEN`].
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_PACKET_LEN {
            return None;
        }
        let mut pkt = Self::new();
        pkt.data[..bytes.len()].copy_from_slice(bytes);
        pkt.len = bytes.len();
        Some(pkt)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        MAX_PACKET_LEN
    }

    /// Truncates the packet to zero length without touching the backing
    /// storage, so it can be reused for the next receive.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Appends `bytes`, returning `Err(())` (and leaving the packet
    /// unmodified) if that would overflow [`MAX_PACKET_LEN`].
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), ()> {
        if self.len + bytes.len() > MAX_PACKET_LEN {
            return Err(());
        }
        self.data[self.len..][..bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }
}

/// Failure transmitting a packet on the underlying transport.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortUnavailable;

/// The capability set the XCP core consumes from its host application.
///
/// Modeled the same way the teacher hands device-specific code a narrow
/// `I2cDevice` rather than a raw peripheral handle: the core never reaches
/// past this trait to touch the transport directly.
pub trait PortInterface {
    /// A free-running millisecond clock. Callers are required to use
    /// wraparound-safe subtraction (`now.wrapping_sub(start)`) when
    /// comparing two readings.
    fn system_get_time_ms(&self) -> u32;

    /// Transmits `packet` on the transport. May block briefly (e.g. for bus
    /// arbitration) but must not wait for a response.
    fn xcp_transmit_packet(
        &mut self,
        packet: &XcpPacket,
    ) -> Result<(), PortUnavailable>;

    /// Non-blocking receive: returns `Some` the moment a whole packet is
    /// available, `None` if nothing is pending yet. The core polls this in
    /// a loop rather than requiring the port to block.
    fn xcp_receive_packet(&mut self) -> Option<XcpPacket>;

    /// Transforms a CONNECT-negotiated seed into the key required to unlock
    /// a protected resource. `None` if the embedding has no seed/key
    /// material available; the loader surfaces this as `ResourceLocked`.
    fn xcp_seed_to_key(&self, seed: &[u8]) -> Option<XcpPacket> {
        let _ = seed;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_from_slice_rejects_oversize() {
        let big = [0u8; MAX_PACKET_LEN + 1];
        assert!(XcpPacket::from_slice(&big).is_none());
    }

    #[test]
    fn packet_extend_respects_capacity() {
        let mut pkt = XcpPacket::from_slice(&[1, 2, 3]).unwrap();
        assert_eq!(pkt.len(), 3);
        let filler = [0u8; MAX_PACKET_LEN - 3];
        assert!(pkt.extend_from_slice(&filler).is_ok());
        assert_eq!(pkt.len(), MAX_PACKET_LEN);
        assert_eq!(pkt.extend_from_slice(&[9]), Err(()));
    }

    #[test]
    fn packet_clear_resets_length() {
        let mut pkt = XcpPacket::from_slice(&[1, 2, 3]).unwrap();
        pkt.clear();
        assert!(pkt.is_empty());
        assert_eq!(pkt.as_slice(), &[]);
    }
}
