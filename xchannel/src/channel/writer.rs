//! Write-side channel API.
//!
//! Output channels buffer writes and drain to the transport when the buffer
//! fills, on explicit [`flush`](Channel::flush), on [`close`](Channel::close),
//! or opportunistically through the auto-flush task once the channel has
//! been idle for one scheduling turn.
//!
//! Buffered data still in a dropped channel is lost; close or flush before
//! letting the last handle go.

use std::path::Path;

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::io::AsyncWrite;

use crate::buffer::ByteBuffer;
use crate::channel::core::{ChannelCore, with_direct_access};
use crate::channel::{Channel, CloseHook, DirectAccess, Output};
use crate::codec::Endian;
use crate::config::ChannelConfig;
use crate::error::{Error, Result};
use crate::transport::Sink;
use crate::{MIN_BUFFER_SIZE, registry};

impl Channel<Output> {
    /// Creates an output channel over any asynchronous writer.
    ///
    /// The channel joins the process-wide output registry swept by
    /// [`flush_all_outputs`](crate::flush_all_outputs).
    pub fn from_writer(
        writer: impl AsyncWrite + Send + Unpin + 'static,
        config: ChannelConfig,
    ) -> Self {
        Self::build(Sink::Writer(Box::new(writer)), &config, None)
    }

    /// Creates an output channel with a close hook that runs when the
    /// channel is closed or aborted.
    pub fn from_writer_with_hook(
        writer: impl AsyncWrite + Send + Unpin + 'static,
        config: ChannelConfig,
        close_hook: CloseHook,
    ) -> Self {
        Self::build(Sink::Writer(Box::new(writer)), &config, Some(close_hook))
    }

    /// Creates an output channel writing into a fixed in-memory buffer of
    /// the given capacity. There is no backing transport, so flush-type
    /// operations fail; retrieve the written bytes with
    /// [`into_bytes`](Channel::into_bytes).
    pub fn of_capacity(capacity: usize) -> Self {
        let buf = ByteBuffer::new(capacity.max(MIN_BUFFER_SIZE));
        Channel::from_core(Box::new(ChannelCore::<Output>::new(buf, Sink::Memory, None)))
    }

    /// Creates a file, truncating it if it exists, and opens an output
    /// channel over it.
    pub async fn create_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = tokio::fs::File::create(path).await?;
        Ok(Self::from_writer(file, ChannelConfig::default()))
    }

    /// Opens a file with caller-chosen options (append, permissions, ...)
    /// and wraps it in an output channel.
    pub async fn open_file_with(
        path: impl AsRef<Path>,
        options: tokio::fs::OpenOptions,
    ) -> Result<Self> {
        let file = options.open(path).await?;
        Ok(Self::from_writer(file, ChannelConfig::default()))
    }

    fn build(io: Sink, config: &ChannelConfig, close_hook: Option<CloseHook>) -> Self {
        let buf = ByteBuffer::new(config.buffer_size());
        let channel = Channel::from_core(Box::new(ChannelCore::<Output>::new(buf, io, close_hook)));
        registry::register(&channel.shared);
        channel
    }

    /// Consumes an in-memory channel and returns the bytes written so far.
    ///
    /// Also works for transported channels, but does not flush: it returns
    /// whatever is still buffered and aborts the channel.
    pub async fn into_bytes(self) -> Result<Vec<u8>> {
        let bytes = self
            .with_lock(async |core| Ok(core.written_prefix().to_vec()))
            .await?;
        self.abort().await?;
        Ok(bytes)
    }

    /// Buffers one byte.
    pub async fn write_u8(&self, byte: u8) -> Result<()> {
        self.with_lock(async move |core| core.write_u8(byte).await)
            .await
    }

    /// Buffers all of `src`, draining to the transport as often as needed.
    pub async fn write_all(&self, src: &[u8]) -> Result<()> {
        self.with_lock(async move |core| core.write_all(src).await)
            .await
    }

    /// Buffers up to `src.len()` bytes with at most one drain cycle, and
    /// returns how many were buffered.
    pub async fn write_from(&self, src: &[u8]) -> Result<usize> {
        self.with_lock(async move |core| core.write_from(src).await)
            .await
    }

    /// Writes the bytes of `line` followed by `\n`.
    pub async fn write_line(&self, line: &str) -> Result<()> {
        self.with_lock(async move |core| core.write_line(line).await)
            .await
    }

    /// Writes one structured value readable by
    /// [`read_value`](Channel::read_value).
    pub async fn write_value<T: Serialize + Sync>(&self, value: &T) -> Result<()> {
        self.with_lock(async move |core| core.write_value(value).await)
            .await
    }

    /// Runs `f` over a contiguous run of exactly `size` writable bytes and
    /// commits them. `size` may not exceed
    /// [`MIN_BUFFER_SIZE`](crate::MIN_BUFFER_SIZE).
    pub async fn block<R, F>(&self, size: usize, f: F) -> Result<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        self.with_lock(async move |core| core.block(size, f).await)
            .await
    }

    /// Hands `f` direct cursor access to the channel buffer.
    ///
    /// The callback may trigger manual drains through
    /// [`DirectAccess::perform`]; the cursor it leaves behind is validated
    /// before the channel resumes normal operation.
    pub async fn direct_access<R, F>(&self, f: F) -> Result<R>
    where
        F: AsyncFnOnce(DirectAccess<'_, Output>) -> Result<R>,
    {
        self.with_lock(async move |core| with_direct_access(core, f).await)
            .await
    }

    /// Writes a 16-bit signed integer with the byte order `E`.
    pub async fn write_i16<E: Endian>(&self, value: i16) -> Result<()> {
        self.with_lock(async move |core| core.block(2, |b| E::write_i16(b, value)).await)
            .await
    }

    /// Writes a 32-bit signed integer with the byte order `E`.
    pub async fn write_i32<E: Endian>(&self, value: i32) -> Result<()> {
        self.with_lock(async move |core| core.block(4, |b| E::write_i32(b, value)).await)
            .await
    }

    /// Writes a 64-bit signed integer with the byte order `E`.
    pub async fn write_i64<E: Endian>(&self, value: i64) -> Result<()> {
        self.with_lock(async move |core| core.block(8, |b| E::write_i64(b, value)).await)
            .await
    }

    /// Writes a 32-bit float with the byte order `E`.
    pub async fn write_f32<E: Endian>(&self, value: f32) -> Result<()> {
        self.with_lock(async move |core| core.block(4, |b| E::write_f32(b, value)).await)
            .await
    }

    /// Writes a 64-bit float with the byte order `E`.
    pub async fn write_f64<E: Endian>(&self, value: f64) -> Result<()> {
        self.with_lock(async move |core| core.block(8, |b| E::write_f64(b, value)).await)
            .await
    }

    /// Writes every line produced by a stream, in order.
    ///
    /// Lines are pulled lazily; concurrent writers may interleave between
    /// lines but never within one. Wrap the call in
    /// [`atomic`](Channel::atomic) for whole-stream atomicity.
    pub async fn write_lines<S>(&self, mut lines: S) -> Result<()>
    where
        S: Stream<Item = String> + Unpin,
    {
        while let Some(line) = lines.next().await {
            self.write_line(&line).await?;
        }
        Ok(())
    }

    /// Writes every byte produced by a stream, in order.
    pub async fn write_bytes<S>(&self, mut bytes: S) -> Result<()>
    where
        S: Stream<Item = u8> + Unpin,
    {
        while let Some(byte) = bytes.next().await {
            self.write_u8(byte).await?;
        }
        Ok(())
    }

    /// Drains every buffered byte to the transport.
    pub async fn flush(&self) -> Result<()> {
        self.with_lock(async |core| core.flush_total().await).await
    }

    /// Closes the channel: one graceful flush, then abort.
    ///
    /// The underlying resource is released even when the flush fails, and
    /// closing an already closed channel succeeds without a second error.
    pub async fn close(&self) -> Result<()> {
        match self.flush().await {
            Ok(()) => self.abort().await,
            Err(Error::Closed) => Ok(()),
            Err(e) => {
                let _ = self.abort().await;
                Err(e)
            }
        }
    }

    /// Current position in the byte stream.
    pub async fn position(&self) -> Result<u64> {
        self.with_lock(async |core| Ok(core.position())).await
    }

    /// Resizes the channel buffer, draining enough buffered bytes first so
    /// that nothing is lost.
    pub async fn resize_buffer(&self, new_size: usize) -> Result<()> {
        self.with_lock(async move |core| core.resize(new_size).await)
            .await
    }
}
