//! Pull-based MLLP frame filter.
//!
//! [`FrameFilter`] wraps a raw byte source and yields only the bytes of
//! well-formed frames, in source order. Orphaned runs and empty frames are
//! excised. When an encoder is configured each payload is rewritten and
//! re-wrapped before it is handed out.
//!
//! ```text
//! source -> read buffer -> Accumulator -> [Encoder] -> pending -> caller
//! ```

use std::io;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, warn};

use crate::encoder::{Encoder, EncoderFailurePolicy};
use crate::frame::{self, Accumulator};

/// Size of a single read from the underlying source (32 KiB).
pub const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Counters for one filter instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    /// Frames handed to the caller.
    pub frames_emitted: u64,
    /// Bytes dropped as orphaned.
    pub orphaned_bytes: u64,
    /// Frames dropped because their payload was empty.
    pub empty_frames: u64,
    /// Payloads the encoder failed to convert.
    pub encoder_failures: u64,
}

/// Turns a raw byte stream into a stream of well-formed MLLP frames.
pub struct FrameFilter<R> {
    /// Underlying byte source.
    reader: R,
    /// Frame assembly state.
    accumulator: Accumulator,
    /// Optional payload encoder.
    encoder: Option<Arc<dyn Encoder>>,
    /// What to do when the encoder fails.
    failure_policy: EncoderFailurePolicy,
    /// Source bytes not yet fed to the accumulator.
    input: BytesMut,
    /// Completed frame still being drained by the caller.
    pending: Bytes,
    /// Scratch buffer for source reads.
    read_buf: Box<[u8]>,
    /// Source reported end of stream.
    eof: bool,
    frames_emitted: u64,
    encoder_failures: u64,
    dropped_after_encode: u64,
}

impl<R: AsyncRead + Unpin> FrameFilter<R> {
    /// Create a filter that passes frames through unchanged.
    pub fn new(reader: R) -> Self {
        Self::with_accumulator(reader, Accumulator::new())
    }

    /// Create a filter with a custom accumulator (e.g. a different frame limit).
    pub fn with_accumulator(reader: R, accumulator: Accumulator) -> Self {
        Self {
            reader,
            accumulator,
            encoder: None,
            failure_policy: EncoderFailurePolicy::default(),
            input: BytesMut::new(),
            pending: Bytes::new(),
            read_buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            eof: false,
            frames_emitted: 0,
            encoder_failures: 0,
            dropped_after_encode: 0,
        }
    }

    /// Re-encode every payload through `encoder`.
    pub fn with_encoder(
        mut self,
        encoder: Arc<dyn Encoder>,
        failure_policy: EncoderFailurePolicy,
    ) -> Self {
        self.encoder = Some(encoder);
        self.failure_policy = failure_policy;
        self
    }

    /// Fill `buf` with bytes of completed frames.
    ///
    /// Returns `Ok(0)` once the source has ended and no further frame can be
    /// produced. Source errors are returned as-is. With
    /// [`EncoderFailurePolicy::CloseSession`] an encoder failure is returned
    /// as an [`io::ErrorKind::Other`] error.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if !self.pending.is_empty() {
                return Ok(self.drain(buf));
            }

            if let Some(frame) = self.scan() {
                self.pending = self.finish_frame(frame).await?;
                continue;
            }

            if self.eof {
                return Ok(0);
            }

            let n = self.reader.read(&mut self.read_buf).await?;
            if n == 0 {
                self.eof = true;
                if self.accumulator.buffered() > 0 {
                    debug!(
                        bytes = self.accumulator.buffered(),
                        "end of stream inside an incomplete frame"
                    );
                }
                return Ok(0);
            }

            self.input.extend_from_slice(&self.read_buf[..n]);
        }
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> FilterStats {
        FilterStats {
            frames_emitted: self.frames_emitted,
            orphaned_bytes: self.accumulator.orphaned_bytes(),
            empty_frames: self.accumulator.empty_frames() + self.dropped_after_encode,
            encoder_failures: self.encoder_failures,
        }
    }

    /// Feed buffered input to the accumulator until a frame completes.
    fn scan(&mut self) -> Option<Bytes> {
        let mut consumed = self.input.len();
        let mut completed = None;

        for (i, &byte) in self.input.iter().enumerate() {
            if let Some(frame) = self.accumulator.push(byte) {
                consumed = i + 1;
                completed = Some(frame);
                break;
            }
        }

        self.input.advance(consumed);
        completed
    }

    /// Apply the encoder, if any, to a completed frame.
    ///
    /// An empty result means nothing is forwarded for this frame.
    async fn finish_frame(&mut self, frame: Bytes) -> io::Result<Bytes> {
        let Some(encoder) = self.encoder.as_ref() else {
            self.frames_emitted += 1;
            return Ok(frame);
        };

        match encoder.encode(frame::payload(&frame)).await {
            Ok(encoded) if encoded.is_empty() => {
                debug!("dropping frame with no content after encoding");
                self.dropped_after_encode += 1;
                Ok(Bytes::new())
            }
            Ok(encoded) => {
                self.frames_emitted += 1;
                Ok(frame::wrap(&encoded))
            }
            Err(e) => {
                self.encoder_failures += 1;
                match self.failure_policy {
                    EncoderFailurePolicy::Forward => {
                        warn!(error = %e, bytes = frame.len(), "encoder failed, forwarding frame unencoded");
                        self.frames_emitted += 1;
                        Ok(frame)
                    }
                    EncoderFailurePolicy::Drop => {
                        warn!(error = %e, bytes = frame.len(), "encoder failed, dropping frame");
                        Ok(Bytes::new())
                    }
                    EncoderFailurePolicy::CloseSession => {
                        error!(error = %e, bytes = frame.len(), "encoder failed, closing session");
                        Err(io::Error::other(e))
                    }
                }
            }
        }
    }

    fn drain(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        n
    }
}
