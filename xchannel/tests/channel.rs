//! End-to-end channel tests over in-memory transports.
//!
//! All tests run on the single-threaded test runtime, which matches the
//! cooperative scheduling model the lock layer is written for.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio::task::yield_now;
use tokio::time::timeout;

use xchannel::{
    BigEndian, Channel, ChannelConfig, Error, Input, InputChannel, LittleEndian, Output,
    from_stream,
};

fn pipe(capacity: usize, buffer_size: usize) -> (Channel<Input>, Channel<Output>) {
    let (a, b) = tokio::io::duplex(capacity);
    let config = ChannelConfig::new().with_buffer_size(buffer_size);
    let input = Channel::from_reader(a, config.clone());
    let output = Channel::from_writer(b, config);
    (input, output)
}

#[tokio::test]
async fn test_writes_arrive_in_order() {
    let (input, output) = pipe(4096, 16);

    // Chunks sized to straddle the 16-byte buffer repeatedly.
    let chunks: &[&[u8]] = &[b"alpha-", b"beta-", b"gamma-delta-epsilon-", b"z"];
    for chunk in chunks {
        output.write_all(chunk).await.unwrap();
    }
    output.flush().await.unwrap();
    output.close().await.unwrap();

    let all = input.read_to_end().await.unwrap();
    assert_eq!(all, b"alpha-beta-gamma-delta-epsilon-z");
}

#[tokio::test]
async fn test_read_into_and_exact() {
    let input = Channel::of_bytes((0u8..10).collect());

    // A bounded read stops at the destination, not at the buffered data.
    let mut buf = [0u8; 4];
    let n = input.read_into(&mut buf).await.unwrap();
    assert_eq!(n, 4);
    assert_eq!(buf, [0, 1, 2, 3]);

    let mut rest = vec![0u8; 6];
    input.read_into_exact(&mut rest).await.unwrap();
    assert_eq!(rest, vec![4, 5, 6, 7, 8, 9]);

    // Exhausted: a bounded read reports 0, an exact read fails.
    let n = input.read_into(&mut buf).await.unwrap();
    assert_eq!(n, 0);
    let err = input.read_into_exact(&mut buf[..1]).await.unwrap_err();
    assert!(matches!(err, Error::EndOfInput));

    // Zero-length requests never touch the transport.
    let n = input.read_into(&mut []).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_loopback_round_trip() {
    let (input, output) = pipe(4096, 64);

    output.write_all(b"payload bytes").await.unwrap();
    output.flush().await.unwrap();

    let mut buf = [0u8; 13];
    input.read_into_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"payload bytes");
}

#[tokio::test]
async fn test_read_line_boundaries() {
    let input = Channel::of_bytes(b"abc\r\nxyz\rq\nabc\r".to_vec());

    assert_eq!(input.read_line().await.unwrap(), "abc");
    assert_eq!(input.read_line().await.unwrap(), "xyz\rq");
    // Lone trailing CR before end-of-stream is preserved.
    assert_eq!(input.read_line().await.unwrap(), "abc\r");
    assert_eq!(input.read_line_opt().await.unwrap(), None);
    assert!(matches!(
        input.read_line().await.unwrap_err(),
        Error::EndOfInput
    ));
}

#[tokio::test]
async fn test_empty_line_and_opt_byte() {
    let input = Channel::of_bytes(b"\nrest".to_vec());
    assert_eq!(input.read_line().await.unwrap(), "");
    assert_eq!(input.read_line().await.unwrap(), "rest");

    let empty = Channel::of_bytes(Vec::new());
    assert_eq!(empty.read_u8_opt().await.unwrap(), None);
    assert!(matches!(
        empty.read_u8().await.unwrap_err(),
        Error::EndOfInput
    ));
}

#[tokio::test]
async fn test_numeric_round_trip_and_cross_endian() {
    let value: i64 = 0x0102_0304_0506_0708;

    let output = Channel::<Output>::of_capacity(64);
    output.write_i64::<LittleEndian>(value).await.unwrap();
    let bytes = output.into_bytes().await.unwrap();
    assert_eq!(bytes.len(), 8);

    let same = Channel::of_bytes(bytes.clone());
    assert_eq!(same.read_i64::<LittleEndian>().await.unwrap(), value);

    // The opposite codec sees the byte-reversed value.
    let crossed = Channel::of_bytes(bytes);
    assert_eq!(
        crossed.read_i64::<BigEndian>().await.unwrap(),
        value.swap_bytes()
    );
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Record {
    id: u32,
    name: String,
    tags: Vec<String>,
}

#[tokio::test]
async fn test_value_round_trip() {
    let record = Record {
        id: 7,
        name: "seven".into(),
        tags: vec!["prime".into(), "odd".into()],
    };

    let output = Channel::<Output>::of_capacity(512);
    output.write_value(&record).await.unwrap();
    output.write_value(&3u16).await.unwrap();
    let bytes = output.into_bytes().await.unwrap();

    let input = Channel::of_bytes(bytes);
    let back: Record = input.read_value().await.unwrap();
    assert_eq!(back, record);
    let small: u16 = input.read_value().await.unwrap();
    assert_eq!(small, 3);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (input, output) = pipe(4096, 64);

    output.write_all(b"tail").await.unwrap();
    output.close().await.unwrap();
    // Second close observes the same result, not a second failure.
    output.close().await.unwrap();
    assert!(output.is_closed());
    assert!(matches!(
        output.write_u8(0).await.unwrap_err(),
        Error::Closed
    ));

    // The graceful close flushed the tail before releasing the resource.
    let all = input.read_to_end().await.unwrap();
    assert_eq!(all, b"tail");

    input.close().await.unwrap();
    input.close().await.unwrap();
    assert!(matches!(input.read_u8().await.unwrap_err(), Error::Closed));
}

#[tokio::test]
async fn test_fifo_fairness() {
    let (_input, output) = pipe(4096, 64);
    let order = Arc::new(Mutex::new(Vec::new()));

    let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
    let blocker = {
        let output = output.clone();
        tokio::spawn(async move {
            output
                .atomic(async move |tmp| {
                    tmp.write_u8(0).await?;
                    let _ = gate_rx.await;
                    Ok(())
                })
                .await
                .unwrap();
        })
    };
    yield_now().await;
    yield_now().await;

    let mut tasks = Vec::new();
    for i in 1u8..=3 {
        let output = output.clone();
        let order = order.clone();
        tasks.push(tokio::spawn(async move {
            output.write_u8(i).await.unwrap();
            order.lock().unwrap().push(i);
        }));
        // Let the task park in the wait queue before spawning the next.
        yield_now().await;
        yield_now().await;
    }

    gate_tx.send(()).unwrap();
    blocker.await.unwrap();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_atomic_writes_never_interleave() {
    let output = Channel::<Output>::of_capacity(64);

    let atomic_task = {
        let output = output.clone();
        tokio::spawn(async move {
            output
                .atomic(async move |tmp| {
                    tmp.write_i32::<LittleEndian>(5).await?;
                    // Give the competing writer every chance to sneak in.
                    yield_now().await;
                    yield_now().await;
                    yield_now().await;
                    tmp.write_i32::<LittleEndian>(6).await?;
                    Ok(())
                })
                .await
                .unwrap();
        })
    };
    let plain_task = {
        let output = output.clone();
        tokio::spawn(async move {
            output.write_i32::<LittleEndian>(7).await.unwrap();
        })
    };
    atomic_task.await.unwrap();
    plain_task.await.unwrap();

    let bytes = output.into_bytes().await.unwrap();
    let words: Vec<i32> = bytes
        .chunks(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert!(
        words == vec![5, 6, 7] || words == vec![7, 5, 6],
        "atomic block was interleaved: {words:?}"
    );
}

#[tokio::test]
async fn test_abort_interrupts_pending_read() {
    let (input, _output) = pipe(4096, 64);

    let reader = {
        let input = input.clone();
        tokio::spawn(async move { input.read_u8().await })
    };
    // Let the reader block inside the transport.
    yield_now().await;
    yield_now().await;

    input.abort().await.unwrap();
    let result = reader.await.unwrap();
    assert!(matches!(result.unwrap_err(), Error::Closed));
}

#[tokio::test]
async fn test_secondary_handle_invalid_after_atomic() {
    let input = Channel::of_bytes(b"xy".to_vec());
    let stash: Arc<Mutex<Option<InputChannel>>> = Arc::new(Mutex::new(None));

    {
        let stash = stash.clone();
        input
            .atomic(async move |tmp| {
                *stash.lock().unwrap() = Some(tmp.clone());
                let b = tmp.read_u8().await?;
                assert_eq!(b, b'x');
                Ok(())
            })
            .await
            .unwrap();
    }

    let stale = stash.lock().unwrap().take().unwrap();
    assert!(matches!(
        stale.read_u8().await.unwrap_err(),
        Error::InvalidChannel
    ));

    // The main handle is unaffected.
    assert_eq!(input.read_u8().await.unwrap(), b'y');
}

#[tokio::test]
async fn test_resize_input_refuses_to_drop_unread() {
    let data: Vec<u8> = (0u8..30).collect();
    let input = Channel::of_bytes(data);

    assert_eq!(input.read_u8().await.unwrap(), 0);
    assert_eq!(input.read_u8().await.unwrap(), 1);

    // 28 unread bytes cannot fit a 20-byte buffer; state is untouched.
    let err = input.resize_buffer(20).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(input.read_u8().await.unwrap(), 2);

    input.resize_buffer(27).await.unwrap();
    let rest = input.read_to_end().await.unwrap();
    assert_eq!(rest, (3u8..30).collect::<Vec<u8>>());
}

#[tokio::test]
async fn test_resize_output_drains_first() {
    let (input, output) = pipe(4096, 32);

    output.write_all(&[b'x'; 24]).await.unwrap();
    output.resize_buffer(16).await.unwrap();
    output.close().await.unwrap();

    let all = input.read_to_end().await.unwrap();
    assert_eq!(all, vec![b'x'; 24]);
}

#[tokio::test]
async fn test_auto_flush_after_idle_turn() {
    let (input, output) = pipe(4096, 64);

    // No explicit flush: the auto-flush task must deliver this.
    output.write_all(b"ping").await.unwrap();

    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(5), input.read_into_exact(&mut buf))
        .await
        .expect("auto-flush never delivered the buffered bytes")
        .unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn test_memory_output_cannot_flush() {
    let output = Channel::<Output>::of_capacity(16);
    output.write_u8(1).await.unwrap();
    assert!(matches!(
        output.flush().await.unwrap_err(),
        Error::NotSupported(_)
    ));

    // Filling the fixed buffer fails once a drain would be required.
    let err = output.write_all(&[0u8; 64]).await.unwrap_err();
    assert!(matches!(err, Error::NotSupported(_)));
}

#[tokio::test]
async fn test_block_size_bounded() {
    let input = Channel::of_bytes(vec![0u8; 64]);
    let err = input.block(17, |_| ()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let output = Channel::<Output>::of_capacity(64);
    let err = output.block(17, |_| ()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn test_direct_access_consume_and_violation() {
    let input = Channel::of_bytes(b"hello".to_vec());

    input
        .direct_access(async |mut da| {
            assert_eq!(&da.data()[..2], b"he");
            let pos = da.position();
            da.set_position(pos + 2);
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(input.read_to_end().await.unwrap(), b"llo");

    let input = Channel::of_bytes(b"hello".to_vec());
    let err = input
        .direct_access(async |mut da| {
            da.set_position(999);
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DirectAccessViolation));
    // The channel recovered a consistent cursor.
    assert!(input.read_to_end().await.is_ok());
}

#[tokio::test]
async fn test_position_tracks_stream_offset() {
    let (input, output) = pipe(4096, 32);

    assert_eq!(output.position().await.unwrap(), 0);
    output.write_all(b"abcdef").await.unwrap();
    assert_eq!(output.position().await.unwrap(), 6);
    output.flush().await.unwrap();
    assert_eq!(output.position().await.unwrap(), 6);

    assert_eq!(input.position().await.unwrap(), 0);
    let mut buf = [0u8; 4];
    input.read_into_exact(&mut buf).await.unwrap();
    assert_eq!(input.position().await.unwrap(), 4);
}

#[tokio::test]
async fn test_lines_stream() {
    let input = Channel::of_bytes(b"one\ntwo\r\nthree".to_vec());
    let lines: Vec<String> = input
        .lines()
        .map(|line| line.unwrap())
        .collect::<Vec<_>>()
        .await;
    assert_eq!(lines, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn test_bytes_stream() {
    let input = Channel::of_bytes(vec![1, 2, 3]);
    let bytes: Vec<u8> = input
        .bytes()
        .map(|byte| byte.unwrap())
        .collect::<Vec<_>>()
        .await;
    assert_eq!(bytes, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_write_lines_stream() {
    let (input, output) = pipe(4096, 64);

    let lines = futures::stream::iter(vec!["first".to_string(), "second".to_string()]);
    output.write_lines(lines).await.unwrap();
    output.close().await.unwrap();

    assert_eq!(input.read_line().await.unwrap(), "first");
    assert_eq!(input.read_line().await.unwrap(), "second");
    assert_eq!(input.read_line_opt().await.unwrap(), None);
}

#[tokio::test]
async fn test_write_from_single_cycle() {
    let (input, output) = pipe(4096, 16);

    let data = [b'a'; 20];
    // Room for 16 bytes; no drain needed, the rest is left to the caller.
    let n = output.write_from(&data).await.unwrap();
    assert_eq!(n, 16);
    // Now full: exactly one drain cycle frees the buffer.
    let n = output.write_from(&data[16..]).await.unwrap();
    assert_eq!(n, 4);

    output.close().await.unwrap();
    assert_eq!(input.read_to_end().await.unwrap(), vec![b'a'; 20]);
}

#[tokio::test]
async fn test_stream_split_halves() {
    let (a, b) = tokio::io::duplex(4096);
    let (input_a, output_a) = from_stream(a, ChannelConfig::default());
    let (input_b, output_b) = from_stream(b, ChannelConfig::default());

    output_a.write_line("over").await.unwrap();
    output_a.flush().await.unwrap();
    assert_eq!(input_b.read_line().await.unwrap(), "over");

    output_b.write_line("and back").await.unwrap();
    output_b.flush().await.unwrap();
    assert_eq!(input_a.read_line().await.unwrap(), "and back");
}

/// A writer that claims to have written more than it was offered.
struct LyingWriter;

impl AsyncWrite for LyingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len() + 1))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_transport_count_violation_is_fatal() {
    let output = Channel::from_writer(LyingWriter, ChannelConfig::default());
    output.write_all(b"data").await.unwrap();
    let err = output.flush().await.unwrap_err();
    assert!(matches!(
        err,
        Error::TransportViolation {
            requested: 4,
            returned: 5
        }
    ));
    // A broken transport does not close the channel by itself.
    assert!(!output.is_closed());
    output.abort().await.unwrap();
}

#[tokio::test]
async fn test_registry_exit_sweep_flushes() {
    let (input, output) = pipe(4096, 64);

    output.write_all(b"last words").await.unwrap();
    xchannel::flush_all_outputs().await;

    let mut buf = [0u8; 10];
    timeout(Duration::from_secs(5), input.read_into_exact(&mut buf))
        .await
        .expect("exit sweep did not flush")
        .unwrap();
    assert_eq!(&buf, b"last words");
}

#[tokio::test]
async fn test_close_hook_runs_once() {
    let count = Arc::new(Mutex::new(0u32));

    let (a, b) = tokio::io::duplex(64);
    let hook_count = count.clone();
    let hook: xchannel::CloseHook = Box::new(move || {
        Box::pin(async move {
            *hook_count.lock().unwrap() += 1;
            Ok(())
        })
    });
    let input = Channel::from_reader_with_hook(a, ChannelConfig::default(), hook);
    input.close().await.unwrap();
    input.close().await.unwrap();
    input.abort().await.unwrap();
    assert_eq!(*count.lock().unwrap(), 1);

    let hook_count = count.clone();
    let hook: xchannel::CloseHook = Box::new(move || {
        Box::pin(async move {
            *hook_count.lock().unwrap() += 1;
            Ok(())
        })
    });
    let output = Channel::from_writer_with_hook(b, ChannelConfig::default(), hook);
    output.close().await.unwrap();
    output.close().await.unwrap();
    assert_eq!(*count.lock().unwrap(), 2);
}

#[tokio::test]
async fn test_queued_caller_fails_on_abort() {
    let (_input, output) = pipe(4096, 64);

    let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
    let holder = {
        let output = output.clone();
        tokio::spawn(async move {
            output
                .atomic(async move |tmp| {
                    tmp.write_u8(0).await?;
                    let _ = gate_rx.await;
                    Ok(())
                })
                .await
        })
    };
    yield_now().await;
    yield_now().await;

    let queued = {
        let output = output.clone();
        tokio::spawn(async move { output.write_u8(1).await })
    };
    yield_now().await;
    yield_now().await;

    output.abort().await.unwrap();
    let _ = gate_tx.send(());

    assert!(matches!(queued.await.unwrap().unwrap_err(), Error::Closed));
    // The holder's atomic block itself keeps running; its next operation
    // observes closure instead.
    let _ = holder.await.unwrap();
}
