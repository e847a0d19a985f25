//! MLLP block markers and the message accumulator.
//!
//! A well-formed frame is `SB <payload> EB CR` with a non-empty payload.
//! Everything else on the wire is orphaned and silently dropped.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

/// Start block.
pub const SB: u8 = 0x0b;

/// End block.
pub const EB: u8 = 0x1c;

/// Carriage return, terminates a frame after `EB`.
pub const CR: u8 = 0x0d;

/// Default upper bound for a single accumulated frame (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Wrap a payload in MLLP framing.
pub fn wrap(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + 3);
    frame.put_u8(SB);
    frame.extend_from_slice(payload);
    frame.put_u8(EB);
    frame.put_u8(CR);
    frame.freeze()
}

/// Payload of a complete frame, without the `SB` and `EB CR` markers.
///
/// Callers must pass a frame produced by [`Accumulator::push`] or [`wrap`].
pub fn payload(frame: &Bytes) -> Bytes {
    debug_assert!(frame.len() >= 3, "frame shorter than its markers");
    frame.slice(1..frame.len() - 2)
}

/// Assembles raw bytes into complete frames, one byte at a time.
///
/// The buffer never spans two start blocks: an `SB` arriving while bytes are
/// buffered drops them as an orphaned partial frame.
#[derive(Debug)]
pub struct Accumulator {
    /// Bytes collected since the last `SB` (or since creation).
    raw: BytesMut,
    /// Frames longer than this are dropped as orphaned.
    max_frame_len: usize,
    /// Total bytes dropped as orphaned.
    orphaned_bytes: u64,
    /// Frames dropped because their payload was empty.
    empty_frames: u64,
}

impl Accumulator {
    /// Create an accumulator with the default frame length limit.
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Create an accumulator with a custom frame length limit.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            raw: BytesMut::new(),
            max_frame_len: max_frame_len.max(4),
            orphaned_bytes: 0,
            empty_frames: 0,
        }
    }

    /// Feed one byte. Returns the frame it completed, framing included.
    pub fn push(&mut self, byte: u8) -> Option<Bytes> {
        if self.raw.len() >= self.max_frame_len {
            self.discard("frame exceeds maximum length");
        }

        match byte {
            SB => {
                trace!(offset = self.raw.len(), "<SB> received");
                if !self.raw.is_empty() {
                    self.discard("orphaned bytes before start block");
                }
                self.raw.put_u8(byte);
                None
            }
            CR => {
                trace!(offset = self.raw.len(), "<CR> received");
                self.raw.put_u8(byte);
                self.complete()
            }
            EB => {
                trace!(offset = self.raw.len(), "<EB> received");
                self.raw.put_u8(byte);
                None
            }
            _ => {
                self.raw.put_u8(byte);
                None
            }
        }
    }

    /// Number of bytes currently buffered towards a frame.
    pub fn buffered(&self) -> usize {
        self.raw.len()
    }

    /// Total bytes dropped as orphaned so far.
    pub fn orphaned_bytes(&self) -> u64 {
        self.orphaned_bytes
    }

    /// Total empty frames (`SB EB CR`) dropped so far.
    pub fn empty_frames(&self) -> u64 {
        self.empty_frames
    }

    /// Check whether the trailing `CR` closed a frame.
    fn complete(&mut self) -> Option<Bytes> {
        if !self.raw.ends_with(&[EB, CR]) {
            return None;
        }

        if self.raw[0] != SB {
            self.discard("end block without start block");
            return None;
        }

        if self.raw.len() <= 3 {
            debug!("dropping frame with no content");
            self.empty_frames += 1;
            self.raw.clear();
            return None;
        }

        debug!(bytes = self.raw.len(), "frame complete");
        Some(self.raw.split().freeze())
    }

    fn discard(&mut self, reason: &'static str) {
        debug!(bytes = self.raw.len(), reason, "dropping orphaned bytes");
        self.orphaned_bytes += self.raw.len() as u64;
        self.raw.clear();
    }
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}
