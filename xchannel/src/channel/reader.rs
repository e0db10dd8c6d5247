//! Read-side channel API.
//!
//! All operations take the channel lock and queue FIFO behind any
//! operation already in progress, so concurrent callers never observe
//! interleaved reads.

use std::path::Path;

use futures::Stream;
use serde::de::DeserializeOwned;
use tokio::io::AsyncRead;

use crate::buffer::ByteBuffer;
use crate::channel::core::{ChannelCore, with_direct_access};
use crate::channel::{Channel, CloseHook, DirectAccess, Input};
use crate::codec::Endian;
use crate::config::ChannelConfig;
use crate::error::Result;
use crate::transport::Source;

impl Channel<Input> {
    /// Creates an input channel over any asynchronous reader.
    pub fn from_reader(
        reader: impl AsyncRead + Send + Unpin + 'static,
        config: ChannelConfig,
    ) -> Self {
        Self::build(Source::Reader(Box::new(reader)), &config, None)
    }

    /// Creates an input channel with a close hook that runs when the
    /// channel is closed or aborted.
    pub fn from_reader_with_hook(
        reader: impl AsyncRead + Send + Unpin + 'static,
        config: ChannelConfig,
        close_hook: CloseHook,
    ) -> Self {
        Self::build(Source::Reader(Box::new(reader)), &config, Some(close_hook))
    }

    /// Creates an input channel that delivers the given bytes and then
    /// reaches end-of-stream. There is no backing transport.
    pub fn of_bytes(bytes: Vec<u8>) -> Self {
        Channel::from_core(Box::new(ChannelCore::<Input>::preloaded(bytes)))
    }

    /// Opens a file for reading.
    pub async fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::from_reader(file, ChannelConfig::default()))
    }

    fn build(io: Source, config: &ChannelConfig, close_hook: Option<CloseHook>) -> Self {
        let buf = ByteBuffer::new(config.buffer_size());
        Channel::from_core(Box::new(ChannelCore::<Input>::new(buf, io, close_hook)))
    }

    /// Reads one byte.
    pub async fn read_u8(&self) -> Result<u8> {
        self.with_lock(async |core| core.read_u8().await).await
    }

    /// Reads one byte; `None` at end-of-stream.
    pub async fn read_u8_opt(&self) -> Result<Option<u8>> {
        self.with_lock(async |core| core.read_u8_opt().await).await
    }

    /// Reads one line.
    ///
    /// `\n` terminates a line and a `\r` immediately before it is stripped;
    /// a `\r` anywhere else is an ordinary character. A partial line at
    /// end-of-stream is returned once; reading past it fails with
    /// [`Error::EndOfInput`](crate::Error::EndOfInput).
    pub async fn read_line(&self) -> Result<String> {
        self.with_lock(async |core| core.read_line().await).await
    }

    /// Like [`read_line`](Channel::read_line) but yields `None` instead of
    /// failing at end-of-stream.
    pub async fn read_line_opt(&self) -> Result<Option<String>> {
        self.with_lock(async |core| core.read_line_opt().await).await
    }

    /// Reads between 1 and `dst.len()` bytes in a single transfer cycle.
    ///
    /// Returns 0 only for an empty `dst` or at end-of-stream; it never
    /// loops to fill the destination completely.
    pub async fn read_into(&self, dst: &mut [u8]) -> Result<usize> {
        self.with_lock(async move |core| core.read_into(dst).await)
            .await
    }

    /// Reads exactly `dst.len()` bytes, failing with
    /// [`Error::EndOfInput`](crate::Error::EndOfInput) if the stream ends
    /// first.
    pub async fn read_into_exact(&self, dst: &mut [u8]) -> Result<()> {
        self.with_lock(async move |core| core.read_into_exact(dst).await)
            .await
    }

    /// Reads everything up to end-of-stream.
    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        self.with_lock(async |core| core.read_to_end().await).await
    }

    /// Reads one structured value written by
    /// [`write_value`](Channel::write_value).
    pub async fn read_value<T: DeserializeOwned>(&self) -> Result<T> {
        self.with_lock(async |core| core.read_value().await).await
    }

    /// Runs `f` over a contiguous run of exactly `size` buffered bytes,
    /// consuming them. `size` may not exceed
    /// [`MIN_BUFFER_SIZE`](crate::MIN_BUFFER_SIZE).
    pub async fn block<R, F>(&self, size: usize, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        self.with_lock(async move |core| core.block(size, f).await)
            .await
    }

    /// Hands `f` direct cursor access to the channel buffer.
    ///
    /// The callback may trigger manual refills through
    /// [`DirectAccess::perform`]; the cursor it leaves behind is validated
    /// before the channel resumes normal operation.
    pub async fn direct_access<R, F>(&self, f: F) -> Result<R>
    where
        F: AsyncFnOnce(DirectAccess<'_, Input>) -> Result<R>,
    {
        self.with_lock(async move |core| with_direct_access(core, f).await)
            .await
    }

    /// Reads a 16-bit signed integer with the byte order `E`.
    pub async fn read_i16<E: Endian>(&self) -> Result<i16> {
        self.with_lock(async |core| core.block(2, E::read_i16).await)
            .await
    }

    /// Reads a 32-bit signed integer with the byte order `E`.
    pub async fn read_i32<E: Endian>(&self) -> Result<i32> {
        self.with_lock(async |core| core.block(4, E::read_i32).await)
            .await
    }

    /// Reads a 64-bit signed integer with the byte order `E`.
    pub async fn read_i64<E: Endian>(&self) -> Result<i64> {
        self.with_lock(async |core| core.block(8, E::read_i64).await)
            .await
    }

    /// Reads a 32-bit float with the byte order `E`.
    pub async fn read_f32<E: Endian>(&self) -> Result<f32> {
        self.with_lock(async |core| core.block(4, E::read_f32).await)
            .await
    }

    /// Reads a 64-bit float with the byte order `E`.
    pub async fn read_f64<E: Endian>(&self) -> Result<f64> {
        self.with_lock(async |core| core.block(8, E::read_f64).await)
            .await
    }

    /// Closes the channel. Input channels have nothing to flush, so this is
    /// the same as [`abort`](Channel::abort).
    pub async fn close(&self) -> Result<()> {
        self.abort().await
    }

    /// Current position in the byte stream.
    pub async fn position(&self) -> Result<u64> {
        self.with_lock(async |core| Ok(core.position())).await
    }

    /// Resizes the channel buffer, preserving unread bytes.
    ///
    /// Fails without changing anything if the new capacity cannot hold the
    /// bytes currently buffered but not yet consumed.
    pub async fn resize_buffer(&self, new_size: usize) -> Result<()> {
        self.with_lock(async move |core| core.resize(new_size)).await
    }

    /// A lazy stream of the remaining bytes. Each item is pulled on demand;
    /// the stream ends at end-of-stream and is not rewindable.
    pub fn bytes(&self) -> impl Stream<Item = Result<u8>> + Send + use<> {
        futures::stream::unfold((self.clone(), false), |(ch, done)| async move {
            if done {
                return None;
            }
            match ch.read_u8_opt().await {
                Ok(None) => None,
                Ok(Some(byte)) => Some((Ok(byte), (ch, false))),
                Err(e) => Some((Err(e), (ch, true))),
            }
        })
    }

    /// A lazy stream of the remaining lines. Each item is pulled on demand;
    /// the stream ends at end-of-stream and is not rewindable.
    pub fn lines(&self) -> impl Stream<Item = Result<String>> + Send + use<> {
        futures::stream::unfold((self.clone(), false), |(ch, done)| async move {
            if done {
                return None;
            }
            match ch.read_line_opt().await {
                Ok(None) => None,
                Ok(Some(line)) => Some((Ok(line), (ch, false))),
                Err(e) => Some((Err(e), (ch, true))),
            }
        })
    }
}
