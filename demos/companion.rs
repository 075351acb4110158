//! Companion - minimal interpreter side of a channel.
//!
//! This example demonstrates:
//! - Connecting back to the socket path the host passed on the command line
//! - Registering command handlers that answer requests and acknowledge puts
//! - Stopping the reader loop when the host asks for `shutdown`
//!
//! It keeps tables in memory and "executes" source by echoing it.
//!
//! # Running
//!
//! ```text
//! cargo run --example companion -- /tmp/kernelwire-1234-abcd.sock
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use kernelwire::codec::{PayloadDecoder, PayloadEncoder};
use kernelwire::{Channel, Message, Responder};
use tokio::sync::Mutex;

type Tables = Arc<Mutex<HashMap<String, Vec<u8>>>>;

async fn execute(message: Message, responder: Responder) -> kernelwire::Result<()> {
    let source = PayloadDecoder::new(message.payload_or_empty()).next_string()?;

    let mut payload = PayloadEncoder::new();
    payload.put_string(&format!("{}\n", source))?.put_string("")?;
    responder.respond("execute", payload.finish()).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .ok_or("usage: companion <socket-path>")?;

    let tables: Tables = Arc::default();
    let put_tables = tables.clone();
    let get_tables = tables.clone();

    let channel = Channel::builder()
        .command("getpid", |_, responder| async move {
            let mut payload = PayloadEncoder::new();
            payload.put_int(std::process::id() as i32);
            responder.respond("getpid", payload.finish()).await
        })
        .command("execute", execute)
        .command("putTable", move |message, responder| {
            let tables = put_tables.clone();
            async move {
                let mut decoder = PayloadDecoder::new(message.payload_or_empty());
                let name = decoder.next_string()?;
                let data = decoder.next_bytes()?;
                tables.lock().await.insert(name, data.to_vec());
                responder.acknowledge().await
            }
        })
        .command("getTable", move |message, responder| {
            let tables = get_tables.clone();
            async move {
                let name = PayloadDecoder::new(message.payload_or_empty()).next_string()?;
                let data = tables.lock().await.get(&name).cloned().unwrap_or_default();

                let mut payload = PayloadEncoder::new();
                payload.put_bytes(&data)?;
                responder.respond("getTable", payload.finish()).await
            }
        })
        .command("reset", move |_, responder| {
            let tables = tables.clone();
            async move {
                tables.lock().await.clear();
                responder.acknowledge().await
            }
        })
        .command("setCustomModulePaths", |message, _| async move {
            let paths = PayloadDecoder::new(message.payload_or_empty()).next_string()?;
            println!("module paths: {}", paths);
            Ok(())
        })
        .command("shutdown", |_, responder| async move {
            responder.acknowledge().await?;
            responder.channel().stop();
            Ok(())
        })
        .connect(&path)
        .await?;

    // Runs until the host sends shutdown or closes the socket
    channel.join().await?;

    Ok(())
}
