//! Transport adapter over the underlying asynchronous resource.
//!
//! A channel performs all external I/O through exactly one bounded
//! operation: refill an input buffer region, or drain an output one. Both
//! directions race the owning channel's abort token so that closing the
//! channel interrupts in-flight transfers instead of leaving the caller
//! blocked on a resource that will never complete.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Boxed reader resource driven by the event loop.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed writer resource driven by the event loop.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read side of a channel's transport.
#[doc(hidden)]
pub enum Source {
    /// An external resource; refills transfer bytes from it.
    Reader(BoxReader),
    /// Fixed in-memory data with no backing resource; refills return 0,
    /// signalling end-of-data.
    Memory,
}

/// Write side of a channel's transport.
#[doc(hidden)]
pub enum Sink {
    /// An external resource; drains transfer bytes to it.
    Writer(BoxWriter),
    /// Fixed in-memory buffer with no backing resource; drains fail.
    Memory,
}

impl Source {
    /// Returns true when a real resource backs this source.
    pub(crate) fn has_backing(&self) -> bool {
        matches!(self, Source::Reader(_))
    }
}

impl Sink {
    /// Returns true when a real resource backs this sink.
    pub(crate) fn has_backing(&self) -> bool {
        matches!(self, Sink::Writer(_))
    }
}

/// Checks the transport count contract: `0 <= n <= requested`.
///
/// A violation means the collaborator is broken; it is surfaced as a hard
/// failure and never clamped.
fn checked(requested: usize, returned: usize) -> Result<usize> {
    if returned > requested {
        return Err(Error::TransportViolation {
            requested,
            returned,
        });
    }
    Ok(returned)
}

/// Performs one bounded read from the source into `dst`.
///
/// Returns the number of bytes transferred; 0 signals end-of-data.
pub(crate) async fn refill(
    source: &mut Source,
    abort: &CancellationToken,
    dst: &mut [u8],
) -> Result<usize> {
    let requested = dst.len();
    let returned = match source {
        Source::Reader(reader) => {
            tokio::select! {
                biased;
                _ = abort.cancelled() => return Err(Error::Closed),
                res = reader.read(dst) => res?,
            }
        }
        Source::Memory => 0,
    };
    log::trace!("refill transferred {returned} of {requested} bytes");
    checked(requested, returned)
}

/// Performs one bounded write of `src` to the sink.
///
/// Returns the number of bytes transferred. A real sink accepting 0 bytes
/// for a non-empty request is an error (the resource stopped accepting
/// data), mirroring the `WriteZero` rule of `write_all` loops.
pub(crate) async fn drain(
    sink: &mut Sink,
    abort: &CancellationToken,
    src: &[u8],
) -> Result<usize> {
    let requested = src.len();
    let returned = match sink {
        Sink::Writer(writer) => {
            tokio::select! {
                biased;
                _ = abort.cancelled() => return Err(Error::Closed),
                res = writer.write(src) => res?,
            }
        }
        Sink::Memory => {
            return Err(Error::NotSupported(
                "flush on a channel backed by a fixed in-memory buffer",
            ));
        }
    };
    if returned == 0 && requested > 0 {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::WriteZero,
            "sink accepted zero bytes",
        )));
    }
    log::trace!("drain transferred {returned} of {requested} bytes");
    checked(requested, returned)
}

/// Shuts down a sink's resource, suppressing failures.
pub(crate) async fn shutdown_sink(sink: &mut Sink) {
    if let Sink::Writer(writer) = sink {
        if let Err(e) = writer.shutdown().await {
            log::debug!("suppressed error while shutting down sink: {e}");
        }
    }
}
