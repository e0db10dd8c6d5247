//! Channel core: the buffered state machine over one I/O direction.
//!
//! A [`ChannelCore`] owns the byte buffer, the `ptr`/`max` cursors, and the
//! transport side for its mode. Every primitive here assumes exclusive
//! access, which the lock layer grants before calling in; nothing in this
//! module synchronizes.
//!
//! Cursor discipline:
//!
//! - input: `ptr..max` is buffered unread data, `max <= capacity`;
//! - output: `ptr` is the write cursor and `max` equals the capacity.

use std::io;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::buffer::ByteBuffer;
use crate::channel::{CloseHook, Input, Mode, Output};
use crate::error::{Error, Result};
use crate::transport::{self, Sink, Source};
use crate::{MAX_VALUE_SIZE, MIN_BUFFER_SIZE, VALUE_HEADER_SIZE};

/// Converts accumulated line bytes, reporting invalid UTF-8 as `InvalidData`.
fn into_utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// The real, unshared state of one channel.
pub(crate) struct ChannelCore<M: Mode> {
    buf: ByteBuffer,
    ptr: usize,
    max: usize,
    /// Bytes actually transferred through the transport, not counting
    /// buffered-but-untransferred data.
    offset: u64,
    io: M::Io,
    abort: CancellationToken,
    close_hook: Option<CloseHook>,
    _mode: PhantomData<M>,
}

impl<M: Mode> ChannelCore<M> {
    /// Returns a handle to the abort token shared with the lock layer.
    pub(crate) fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Returns the buffer capacity.
    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Validates the cursor invariant after a `direct_access` callback.
    fn check_cursors(&self) -> Result<()> {
        if self.ptr > self.max || self.max > self.buf.len() {
            return Err(Error::DirectAccessViolation);
        }
        Ok(())
    }

    /// Releases the underlying resource. Called exactly once per channel;
    /// the lock layer guarantees a single owner for the boxed core.
    pub(crate) async fn dispose(mut self: Box<Self>) {
        M::shutdown_io(&mut self.io).await;
        if let Some(hook) = self.close_hook.take() {
            if let Err(e) = hook().await {
                log::debug!("suppressed error from close hook: {e}");
            }
        }
        log::debug!("{} channel resources released", M::NAME);
    }
}

impl ChannelCore<Input> {
    pub(crate) fn new(buf: ByteBuffer, io: Source, close_hook: Option<CloseHook>) -> Self {
        Self {
            buf,
            ptr: 0,
            max: 0,
            offset: 0,
            io,
            abort: CancellationToken::new(),
            close_hook,
            _mode: PhantomData,
        }
    }

    /// Builds an in-memory channel whose buffer already holds all the data
    /// it will ever deliver.
    pub(crate) fn preloaded(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            buf: ByteBuffer::from_vec(bytes),
            ptr: 0,
            max: len,
            // Preloaded data counts as already transferred so that the
            // channel position starts at zero.
            offset: len as u64,
            io: Source::Memory,
            abort: CancellationToken::new(),
            close_hook: None,
            _mode: PhantomData,
        }
    }

    /// Current read position in the byte stream.
    pub(crate) fn position(&self) -> u64 {
        self.offset - (self.max - self.ptr) as u64
    }

    /// Refills the whole buffer, discarding the (already consumed) window.
    ///
    /// Returns the transferred count; 0 is end-of-stream.
    async fn refill_reset(&mut self) -> Result<usize> {
        debug_assert_eq!(self.ptr, self.max);
        let n = transport::refill(&mut self.io, &self.abort, self.buf.as_mut_slice()).await?;
        self.ptr = 0;
        self.max = n;
        self.offset += n as u64;
        Ok(n)
    }

    /// Refills the free region after `max`, keeping buffered data in place.
    async fn refill_more(&mut self) -> Result<usize> {
        let max = self.max;
        let n =
            transport::refill(&mut self.io, &self.abort, &mut self.buf.as_mut_slice()[max..])
                .await?;
        self.max += n;
        self.offset += n as u64;
        Ok(n)
    }

    /// Moves unread bytes to the front of the buffer.
    fn compact(&mut self) {
        if self.ptr > 0 {
            self.buf.copy_within(self.ptr..self.max, 0);
            self.max -= self.ptr;
            self.ptr = 0;
        }
    }

    /// Reads one byte, `None` at end-of-stream.
    pub(crate) async fn read_u8_opt(&mut self) -> Result<Option<u8>> {
        loop {
            if self.ptr < self.max {
                let b = self.buf.byte(self.ptr);
                self.ptr += 1;
                return Ok(Some(b));
            }
            if self.refill_reset().await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Reads one byte, failing with [`Error::EndOfInput`] at end-of-stream.
    pub(crate) async fn read_u8(&mut self) -> Result<u8> {
        match self.read_u8_opt().await? {
            Some(b) => Ok(b),
            None => Err(Error::EndOfInput),
        }
    }

    /// Reads one line, `None` if the stream ended before any byte arrived.
    ///
    /// `\n` terminates a line; a `\r` immediately before it is stripped. A
    /// `\r` not followed by `\n` is an ordinary character. End-of-stream
    /// with a partial line buffered yields that partial line once.
    pub(crate) async fn read_line_opt(&mut self) -> Result<Option<String>> {
        let mut acc: Vec<u8> = Vec::new();
        let mut cr = false;
        let mut any = false;
        loop {
            match self.read_u8_opt().await? {
                None => {
                    if cr {
                        acc.push(b'\r');
                    }
                    if !any {
                        return Ok(None);
                    }
                    return into_utf8(acc).map(Some);
                }
                Some(b'\n') => return into_utf8(acc).map(Some),
                Some(b'\r') => {
                    any = true;
                    if cr {
                        acc.push(b'\r');
                    }
                    cr = true;
                }
                Some(b) => {
                    any = true;
                    if cr {
                        acc.push(b'\r');
                        cr = false;
                    }
                    acc.push(b);
                }
            }
        }
    }

    /// Reads one line, failing with [`Error::EndOfInput`] if the stream
    /// ended before any byte arrived.
    pub(crate) async fn read_line(&mut self) -> Result<String> {
        match self.read_line_opt().await? {
            Some(line) => Ok(line),
            None => Err(Error::EndOfInput),
        }
    }

    /// Reads between 1 and `dst.len()` bytes in a single transfer cycle.
    ///
    /// Returns 0 only for an empty destination or at end-of-stream.
    pub(crate) async fn read_into(&mut self, dst: &mut [u8]) -> Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        loop {
            let available = self.max - self.ptr;
            if available > 0 {
                let n = available.min(dst.len());
                dst[..n].copy_from_slice(self.buf.slice(self.ptr..self.ptr + n));
                self.ptr += n;
                return Ok(n);
            }
            if self.refill_reset().await? == 0 {
                return Ok(0);
            }
        }
    }

    /// Reads exactly `dst.len()` bytes or fails with [`Error::EndOfInput`].
    pub(crate) async fn read_into_exact(&mut self, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            let n = self.read_into(dst).await?;
            if n == 0 {
                return Err(Error::EndOfInput);
            }
            let tmp = dst;
            dst = &mut tmp[n..];
        }
        Ok(())
    }

    /// Drains the channel to end-of-stream and returns everything read.
    ///
    /// Chunks are accumulated and assembled once at the end, so total copy
    /// work stays linear in the stream length.
    pub(crate) async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut total = 0usize;
        loop {
            if self.ptr < self.max {
                let chunk = self.buf.slice(self.ptr..self.max).to_vec();
                self.ptr = self.max;
                total += chunk.len();
                chunks.push(chunk);
            }
            if self.refill_reset().await? == 0 {
                break;
            }
        }
        let mut out = Vec::with_capacity(total);
        for chunk in &chunks {
            out.extend_from_slice(chunk);
        }
        Ok(out)
    }

    /// Runs `f` over a contiguous run of exactly `size` buffered bytes and
    /// consumes them.
    ///
    /// `size` may not exceed [`MIN_BUFFER_SIZE`], so the run always fits the
    /// buffer of any channel.
    pub(crate) async fn block<R>(
        &mut self,
        size: usize,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R> {
        if size > MIN_BUFFER_SIZE {
            return Err(Error::InvalidArgument(
                "block size exceeds the minimum buffer size",
            ));
        }
        while self.max - self.ptr < size {
            self.compact();
            if self.refill_more().await? == 0 {
                return Err(Error::EndOfInput);
            }
        }
        let r = f(self.buf.slice(self.ptr..self.ptr + size));
        self.ptr += size;
        Ok(r)
    }

    /// Reads one length-prefixed structured value.
    pub(crate) async fn read_value<T: DeserializeOwned>(&mut self) -> Result<T> {
        let len = self
            .block(VALUE_HEADER_SIZE, |b| {
                u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            })
            .await?;
        if len > MAX_VALUE_SIZE as u64 {
            return Err(Error::InvalidArgument(
                "encoded value length exceeds the maximum value size",
            ));
        }
        let mut payload = vec![0u8; len as usize];
        self.read_into_exact(&mut payload).await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Resizes the buffer, preserving unread bytes.
    ///
    /// Fails without touching the buffer if the new capacity cannot hold the
    /// currently unread data.
    pub(crate) fn resize(&mut self, new_size: usize) -> Result<()> {
        let new_size = new_size.max(MIN_BUFFER_SIZE);
        let unread = self.max - self.ptr;
        if new_size < unread {
            return Err(Error::InvalidArgument(
                "new buffer size is below the unread byte count",
            ));
        }
        if new_size != self.buf.len() {
            self.buf.replace(new_size, self.ptr..self.max);
            self.ptr = 0;
            self.max = unread;
        }
        Ok(())
    }
}

impl ChannelCore<Output> {
    pub(crate) fn new(buf: ByteBuffer, io: Sink, close_hook: Option<CloseHook>) -> Self {
        let max = buf.len();
        Self {
            buf,
            ptr: 0,
            max,
            offset: 0,
            io,
            abort: CancellationToken::new(),
            close_hook,
            _mode: PhantomData,
        }
    }

    /// Current write position in the byte stream.
    pub(crate) fn position(&self) -> u64 {
        self.offset + self.ptr as u64
    }

    /// Number of buffered bytes not yet handed to the transport.
    pub(crate) fn pending_bytes(&self) -> usize {
        self.ptr
    }

    /// Whether a real resource backs this channel.
    pub(crate) fn is_backed(&self) -> bool {
        self.io.has_backing()
    }

    /// The written prefix of an in-memory channel's buffer.
    pub(crate) fn written_prefix(&self) -> &[u8] {
        self.buf.slice(0..self.ptr)
    }

    /// Performs one drain cycle, moving the remainder to the buffer front.
    pub(crate) async fn flush_partial(&mut self) -> Result<usize> {
        let ptr = self.ptr;
        let n = transport::drain(&mut self.io, &self.abort, self.buf.slice(0..ptr)).await?;
        if n < ptr {
            self.buf.copy_within(n..ptr, 0);
        }
        self.ptr = ptr - n;
        self.offset += n as u64;
        Ok(n)
    }

    /// Drains until no buffered bytes remain.
    pub(crate) async fn flush_total(&mut self) -> Result<()> {
        while self.ptr > 0 {
            self.flush_partial().await?;
        }
        Ok(())
    }

    /// Best-effort total flush for cleanup paths; failures are logged and
    /// swallowed.
    pub(crate) async fn safe_flush_total(&mut self) {
        if let Err(e) = self.flush_total().await {
            log::debug!("suppressed flush failure: {e}");
        }
    }

    /// Buffers one byte, draining first if the buffer is full.
    pub(crate) async fn write_u8(&mut self, byte: u8) -> Result<()> {
        if self.ptr == self.max {
            self.flush_partial().await?;
        }
        let p = self.ptr;
        self.buf.set_byte(p, byte);
        self.ptr += 1;
        Ok(())
    }

    /// Buffers up to `src.len()` bytes with at most one drain cycle.
    ///
    /// Returns the number of bytes buffered, which is less than requested
    /// only when the single drain left insufficient room.
    pub(crate) async fn write_from(&mut self, src: &[u8]) -> Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        if self.ptr == self.max {
            self.flush_partial().await?;
        }
        let n = src.len().min(self.max - self.ptr);
        let p = self.ptr;
        self.buf.copy_from(p, &src[..n]);
        self.ptr += n;
        Ok(n)
    }

    /// Buffers all of `src`, draining as many times as necessary.
    pub(crate) async fn write_all(&mut self, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let n = self.write_from(src).await?;
            src = &src[n..];
        }
        Ok(())
    }

    /// Writes a line: the bytes of `line` followed by `\n`.
    pub(crate) async fn write_line(&mut self, line: &str) -> Result<()> {
        self.write_all(line.as_bytes()).await?;
        self.write_u8(b'\n').await
    }

    /// Runs `f` over a contiguous run of exactly `size` writable bytes and
    /// commits them.
    pub(crate) async fn block<R>(
        &mut self,
        size: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        if size > MIN_BUFFER_SIZE {
            return Err(Error::InvalidArgument(
                "block size exceeds the minimum buffer size",
            ));
        }
        while self.max - self.ptr < size {
            self.flush_partial().await?;
        }
        let p = self.ptr;
        let r = f(self.buf.slice_mut(p..p + size));
        self.ptr += size;
        Ok(r)
    }

    /// Writes one length-prefixed structured value.
    pub(crate) async fn write_value<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        let header = (payload.len() as u64).to_le_bytes();
        self.write_all(&header).await?;
        self.write_all(&payload).await
    }

    /// Resizes the buffer, draining enough pending bytes first so that the
    /// new capacity can hold the remainder.
    pub(crate) async fn resize(&mut self, new_size: usize) -> Result<()> {
        let new_size = new_size.max(MIN_BUFFER_SIZE);
        while self.ptr > new_size {
            self.flush_partial().await?;
        }
        if new_size != self.buf.len() {
            self.buf.replace(new_size, 0..self.ptr);
            self.max = new_size;
        }
        Ok(())
    }
}

/// Cursor-level access to a channel's buffer inside [`direct_access`].
///
/// The capability borrows the channel core, so it cannot outlive the
/// callback it was handed to; the cursor it leaves behind is validated
/// before the channel resumes normal operation.
///
/// [`direct_access`]: crate::channel::Channel::direct_access
pub struct DirectAccess<'a, M: Mode> {
    core: &'a mut ChannelCore<M>,
}

impl<'a, M: Mode> DirectAccess<'a, M> {
    pub(crate) fn new(core: &'a mut ChannelCore<M>) -> Self {
        Self { core }
    }

    /// Current cursor position within the buffer.
    pub fn position(&self) -> usize {
        self.core.ptr
    }

    /// Upper bound of the valid cursor range.
    pub fn limit(&self) -> usize {
        self.core.max
    }

    /// Buffer capacity.
    pub fn capacity(&self) -> usize {
        self.core.buf.len()
    }

    /// Moves the cursor. The value is validated at the next [`perform`]
    /// call and when the callback returns; a position outside
    /// `0..=limit` fails with [`Error::DirectAccessViolation`] then.
    ///
    /// [`perform`]: DirectAccess::perform
    pub fn set_position(&mut self, position: usize) {
        self.core.ptr = position;
    }
}

impl<'a> DirectAccess<'a, Input> {
    /// The unread bytes between the cursor and the limit.
    pub fn data(&self) -> &[u8] {
        if self.core.ptr > self.core.max {
            return &[];
        }
        self.core.buf.slice(self.core.ptr..self.core.max)
    }

    /// Performs one manual refill cycle and returns the transferred count.
    pub async fn perform(&mut self) -> Result<usize> {
        self.core.check_cursors()?;
        if self.core.ptr == self.core.max {
            self.core.refill_reset().await
        } else {
            self.core.compact();
            self.core.refill_more().await
        }
    }
}

impl<'a> DirectAccess<'a, Output> {
    /// The writable bytes between the cursor and the limit.
    pub fn space(&mut self) -> &mut [u8] {
        if self.core.ptr > self.core.max {
            return &mut [];
        }
        self.core.buf.slice_mut(self.core.ptr..self.core.max)
    }

    /// Performs one manual drain cycle and returns the transferred count.
    pub async fn perform(&mut self) -> Result<usize> {
        self.core.check_cursors()?;
        if self.core.ptr == 0 {
            return Ok(0);
        }
        self.core.flush_partial().await
    }
}

/// Runs a direct-access callback and re-validates the cursors it left.
///
/// The cursor check runs whether or not the callback succeeded, so a failed
/// callback can never leave the channel with an out-of-bounds cursor; if it
/// did, the cursor is clamped back into range and the defect is reported
/// instead of the callback's own result.
pub(crate) async fn with_direct_access<M, R, F>(core: &mut ChannelCore<M>, f: F) -> Result<R>
where
    M: Mode,
    F: AsyncFnOnce(DirectAccess<'_, M>) -> Result<R>,
{
    let r = f(DirectAccess::new(core)).await;
    if core.check_cursors().is_err() {
        core.max = core.max.min(core.buf.len());
        core.ptr = core.ptr.min(core.max);
        return Err(Error::DirectAccessViolation);
    }
    r
}
