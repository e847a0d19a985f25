//! MLLP framing for HL7 v2 byte streams.
//!
//! This library provides:
//! - The MLLP block markers and frame helpers
//! - A byte-at-a-time accumulator that recovers from orphaned bytes
//! - A pull-based filter that turns a raw byte stream into well-formed frames
//! - An encoder seam for re-encoding payloads through an external converter
//!
//! ## Usage
//!
//! ```ignore
//! use hl7_mllp::FrameFilter;
//!
//! let mut filter = FrameFilter::new(socket);
//! let mut buf = vec![0u8; 8192];
//! let n = filter.read(&mut buf).await?;
//! ```

mod encoder;
mod filter;
mod frame;

pub use encoder::{CommandEncoder, EncodeError, Encoder, EncoderFailurePolicy};
pub use filter::{FilterStats, FrameFilter, READ_BUFFER_SIZE};
pub use frame::{payload, wrap, Accumulator, CR, DEFAULT_MAX_FRAME_LEN, EB, SB};
