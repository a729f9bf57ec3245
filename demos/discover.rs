//! Discover a HEOS device, connect, and print everything it sends.
//!
//! Logs at `INFO` through `tracing-subscriber`.
//!
//! ```text
//! cargo run --example discover
//! ```

use heos_control::{Discoverer, HeosClient, HeosCommand, HeosError, DEFAULT_TIMEOUT};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let discoverer = Discoverer::new();
    let devices = discoverer.discover_devices(DEFAULT_TIMEOUT, None).await?;
    if devices.is_empty() {
        println!("No HEOS devices found");
        return Ok(());
    }
    for ip in &devices {
        println!("Found HEOS device at {}", ip);
    }

    let client = HeosClient::new(devices[0]);
    client.events().on_all(|response| async move {
        println!(
            "{} [{}] {}",
            response.command(),
            response.header.result,
            response.header.message.raw()
        );
    });

    let mut faults = client.events().faults();
    tokio::spawn(async move {
        loop {
            match faults.recv().await {
                Ok(fault) => eprintln!("fault: {:?}", fault),
                Err(HeosError::ChannelError(e)) => eprintln!("fault stream: {}", e),
                Err(_) => break,
            }
        }
    });

    client.connect().await?;

    let players = client
        .request(&"player/get_players".parse::<HeosCommand>()?)
        .await?;
    if let Some(payload) = &players.payload {
        println!("Players: {}", serde_json::to_string_pretty(payload)?);
    }

    let register = "system/register_for_change_events"
        .parse::<HeosCommand>()?
        .with_attribute("enable", "on");
    client.send(&register).await?;

    tokio::select! {
        result = client.wait() => result?,
        _ = tokio::signal::ctrl_c() => client.disconnect().await,
    }

    Ok(())
}
