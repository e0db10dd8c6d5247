//! Buffered channels and their locking layer.
//!
//! A [`Channel`] is a cheap cloneable handle; the buffered state itself
//! lives behind the lock layer in `lock.rs` and is only ever touched by the
//! one logical operation currently holding the channel busy. The mode tag
//! ([`Input`] or [`Output`]) selects the legal primitive set at compile
//! time.

mod core;
#[doc(hidden)]
pub mod lock;
mod reader;
mod writer;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::channel::core::ChannelCore;
use crate::channel::lock::{LockState, Shared};
use crate::config::ChannelConfig;
use crate::error::Result;
use crate::transport::{Sink, Source};

pub use self::core::DirectAccess;

/// Deferred action that releases the underlying resource.
///
/// Invoked at most once, when the channel is closed or aborted.
pub type CloseHook = Box<dyn FnOnce() -> BoxFuture<'static, std::io::Result<()>> + Send>;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Input {}
    impl Sealed for super::Output {}
}

/// Capability tag selecting a channel's primitive set at compile time.
///
/// Implemented only by [`Input`] and [`Output`].
pub trait Mode: sealed::Sealed + Send + Sync + Sized + 'static {
    /// Transport side driven by channels of this mode.
    #[doc(hidden)]
    type Io: Send + 'static;

    /// Direction name used in log output.
    const NAME: &'static str;

    /// Hook run, with the lock state held, after an unlock left the channel
    /// idle with an empty wait queue.
    #[doc(hidden)]
    fn on_idle(shared: &Arc<Shared<Self>>, state: &mut LockState<Self>);

    /// Hook run once when the channel is aborted.
    #[doc(hidden)]
    fn on_abort(shared: &Arc<Shared<Self>>);

    /// Releases the transport resource during disposal.
    #[doc(hidden)]
    fn shutdown_io(io: &mut Self::Io) -> impl std::future::Future<Output = ()> + Send;
}

/// Mode tag for read channels.
#[derive(Debug, Clone, Copy)]
pub struct Input;

/// Mode tag for write channels.
#[derive(Debug, Clone, Copy)]
pub struct Output;

impl Mode for Input {
    type Io = Source;
    const NAME: &'static str = "input";

    fn on_idle(_shared: &Arc<Shared<Self>>, _state: &mut LockState<Self>) {}

    fn on_abort(_shared: &Arc<Shared<Self>>) {}

    fn shutdown_io(_io: &mut Source) -> impl std::future::Future<Output = ()> + Send {
        // Dropping the reader releases it.
        std::future::ready(())
    }
}

impl Mode for Output {
    type Io = Sink;
    const NAME: &'static str = "output";

    fn on_idle(shared: &Arc<Shared<Self>>, state: &mut LockState<Self>) {
        lock::schedule_auto_flush(shared, state);
    }

    fn on_abort(shared: &Arc<Shared<Self>>) {
        crate::registry::deregister(shared);
    }

    fn shutdown_io(io: &mut Sink) -> impl std::future::Future<Output = ()> + Send {
        crate::transport::shutdown_sink(io)
    }
}

/// A handle to a buffered channel.
///
/// Handles are cheap to clone; all clones address the same channel and
/// contend for the same lock. Handles created by [`Channel::atomic`] are
/// scoped to their atomic block and fail with
/// [`Error::InvalidChannel`](crate::Error::InvalidChannel) afterwards.
pub struct Channel<M: Mode> {
    pub(crate) shared: Arc<Shared<M>>,
    pub(crate) idx: usize,
    pub(crate) generation: u64,
}

/// A read channel.
pub type InputChannel = Channel<Input>;

/// A write channel.
pub type OutputChannel = Channel<Output>;

impl<M: Mode> Clone for Channel<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            idx: self.idx,
            generation: self.generation,
        }
    }
}

impl<M: Mode> fmt::Debug for Channel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("mode", &M::NAME)
            .field("wrapper", &self.idx)
            .finish()
    }
}

impl<M: Mode> Channel<M> {
    /// Wraps a freshly built core into a main channel handle.
    pub(crate) fn from_core(core: Box<ChannelCore<M>>) -> Self {
        Self {
            shared: Shared::new(core),
            idx: 0,
            generation: 0,
        }
    }

    /// Rebuilds the main handle from shared state (registry sweeps).
    pub(crate) fn from_shared(shared: Arc<Shared<M>>) -> Self {
        Self {
            shared,
            idx: 0,
            generation: 0,
        }
    }

    /// Runs one primitive under the channel lock, queueing FIFO if busy.
    pub(crate) async fn with_lock<R, F>(&self, f: F) -> Result<R>
    where
        F: AsyncFnOnce(&mut ChannelCore<M>) -> Result<R>,
    {
        let mut guard = Shared::acquire(&self.shared, self.idx, self.generation).await?;
        f(guard.core_mut()).await
    }

    /// Runs a sequence of operations as one indivisible unit.
    ///
    /// The callback receives a temporary channel handle scoped to the block;
    /// operations through it never interleave with operations on this
    /// handle. Once the block completes the temporary handle is invalid and
    /// any further use of it fails.
    pub async fn atomic<R, F>(&self, f: F) -> Result<R>
    where
        F: AsyncFnOnce(Channel<M>) -> Result<R>,
    {
        Shared::atomic(&self.shared, self.idx, self.generation, f).await
    }

    /// Aborts the channel: fails pending and future operations, interrupts
    /// in-flight transport I/O, and releases the underlying resource.
    ///
    /// Aborting an already aborted channel is a no-op.
    pub async fn abort(&self) -> Result<()> {
        Shared::abort(&self.shared).await
    }

    /// True once the channel has been closed or aborted.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Returns the current buffer capacity.
    pub async fn buffer_size(&self) -> Result<usize> {
        self.with_lock(async |core| Ok(core.capacity())).await
    }
}

/// Splits a bidirectional stream into an input and an output channel.
///
/// The halves are independent channels over the same resource; each side is
/// closed separately.
pub fn from_stream<S>(stream: S, config: ChannelConfig) -> (InputChannel, OutputChannel)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        Channel::from_reader(read_half, config.clone()),
        Channel::from_writer(write_half, config),
    )
}
