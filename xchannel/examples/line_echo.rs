//! Echo over a bidirectional in-memory stream.
//!
//! One task echoes back every line it reads; the main task sends a few
//! lines and prints the replies. The same wiring works for any
//! `AsyncRead + AsyncWrite` stream, e.g. a `TcpStream`.
//!
//! Run with: RUST_LOG=debug cargo run --example line_echo

use log::info;
use xchannel::{ChannelConfig, from_stream};

#[tokio::main]
async fn main() -> xchannel::Result<()> {
    env_logger::init();

    let (near, far) = tokio::io::duplex(4096);
    let (input, output) = from_stream(near, ChannelConfig::default());
    let (peer_input, peer_output) = from_stream(far, ChannelConfig::default());

    let echo = tokio::spawn(async move {
        while let Ok(Some(line)) = peer_input.read_line_opt().await {
            info!("echo task got {line:?}");
            if peer_output.write_line(&line).await.is_err() {
                break;
            }
            // No explicit flush: auto-flush delivers the reply after one
            // idle scheduling turn.
        }
        let _ = peer_output.close().await;
    });

    for message in ["hello", "buffered", "world"] {
        output.write_line(message).await?;
        let reply = input.read_line().await?;
        info!("reply: {reply:?}");
        println!("sent {message:?}, got {reply:?}");
    }

    output.close().await?;
    echo.await.expect("echo task failed");
    input.close().await?;

    Ok(())
}
