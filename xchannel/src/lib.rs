//! # XChannel - Buffered Channel I/O
//!
//! XChannel layers buffered, lock-disciplined channel I/O on top of any
//! asynchronous byte stream:
//!
//! - **Buffered channels**: one fixed-capacity buffer per direction, with
//!   byte, line, block, bulk, and structured-value primitives
//! - **Atomicity**: concurrent callers queue FIFO; `atomic` composes several
//!   primitives into one indivisible unit
//! - **Auto-flush**: buffered output drains by itself after one idle
//!   scheduling turn, without explicit flush calls
//! - **Prompt cancellation**: closing a channel interrupts in-flight
//!   transport I/O instead of waiting for it
//! - **Exit sweep**: a process-wide registry flushes every live output
//!   channel before shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Caller Tasks                        │
//! ├─────────────────────────────────────────────────────────┤
//! │                  Channel (lock layer)                   │
//! │  ┌─────────────┐ ┌──────────────┐ ┌─────────────────┐   │
//! │  │ FIFO Queue  │ │ Atomic Block │ │   Auto-Flush    │   │
//! │  └─────────────┘ └──────────────┘ └─────────────────┘   │
//! ├─────────────────────────────────────────────────────────┤
//! │                  Channel Core                           │
//! │  ┌─────────────┐ ┌──────────────┐ ┌─────────────────┐   │
//! │  │ Byte Buffer │ │   Cursors    │ │ Numeric Codecs  │   │
//! │  └─────────────┘ └──────────────┘ └─────────────────┘   │
//! ├─────────────────────────────────────────────────────────┤
//! │                  Transport Adapter                      │
//! │  ┌─────────────────────────────────────────────────┐    │
//! │  │       AsyncRead / AsyncWrite  (or memory)       │    │
//! │  └─────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use xchannel::{from_stream, ChannelConfig};
//!
//! let (input, output) = from_stream(stream, ChannelConfig::default());
//!
//! output.write_line("hello").await?;
//! output.flush().await?;
//!
//! let line = input.read_line().await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod buffer;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod registry;
#[doc(hidden)]
pub mod transport;

// Re-export commonly used types
pub use channel::{
    Channel, CloseHook, DirectAccess, Input, InputChannel, Mode, Output, OutputChannel,
    from_stream,
};
pub use codec::{BigEndian, Endian, LittleEndian, NativeEndian};
pub use config::ChannelConfig;
pub use error::{Error, Result};
pub use registry::flush_all_outputs;

/// Smallest channel buffer capacity; configured sizes are raised to this
/// floor. Block operations are bounded by it, so a block always fits.
pub const MIN_BUFFER_SIZE: usize = 16;

/// Default channel buffer capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 65536;

/// Size of the length header preceding a structured value.
pub const VALUE_HEADER_SIZE: usize = 8;

/// Largest accepted encoded length for a structured value.
pub const MAX_VALUE_SIZE: usize = 64 * 1024 * 1024;
