//! Basic usage example demonstrating buffered channels.
//!
//! This example shows how to:
//! - Read from an in-memory channel
//! - Use the numeric codecs
//! - Frame and recover structured values
//!
//! Run with: cargo run --example basic_usage

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use xchannel::{BigEndian, Channel, LittleEndian, Output};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Greeting {
    to: String,
    excited: bool,
}

#[tokio::main]
async fn main() -> xchannel::Result<()> {
    println!("=== XChannel Basic Usage Example ===\n");

    // Example 1: line reading
    println!("1. Line Reading:");
    let input = Channel::of_bytes(b"first line\r\nsecond line\npartial".to_vec());
    while let Some(line) = input.read_line_opt().await? {
        println!("   line: {line:?}");
    }
    println!();

    // Example 2: numeric codecs
    println!("2. Numeric Codecs:");
    let output = Channel::<Output>::of_capacity(64);
    output.write_i32::<LittleEndian>(0xC0FFEE).await?;
    output.write_f64::<LittleEndian>(2.5).await?;
    let bytes = output.into_bytes().await?;
    println!("   Encoded {} bytes", bytes.len());

    let input = Channel::of_bytes(bytes.clone());
    println!(
        "   i32 (little-endian): 0x{:X}",
        input.read_i32::<LittleEndian>().await?
    );
    println!("   f64 (little-endian): {}", input.read_f64::<LittleEndian>().await?);

    let crossed = Channel::of_bytes(bytes);
    println!(
        "   Same i32 read big-endian: 0x{:X}\n",
        crossed.read_i32::<BigEndian>().await?
    );

    // Example 3: structured values
    println!("3. Structured Values:");
    let output = Channel::<Output>::of_capacity(256);
    output
        .write_value(&Greeting {
            to: "world".into(),
            excited: true,
        })
        .await?;
    let bytes = output.into_bytes().await?;

    let input = Channel::of_bytes(bytes);
    let greeting: Greeting = input.read_value().await?;
    println!("   Decoded: {greeting:?}\n");

    // Example 4: byte streams
    println!("4. Byte Stream:");
    let input = Channel::of_bytes(b"stream".to_vec());
    let count = input.bytes().count().await;
    println!("   Streamed {count} bytes");

    println!("\n=== Example Complete ===");
    Ok(())
}
