//! Card read example
//!
//! Configure with MAGSTRIPE_DEVICE, MAGSTRIPE_BAUD and MAGSTRIPE_MASTER_KEY.

use std::time::Duration;

use magstripe::{CardDetails, LedMode, Reader, ReaderConfig, TrackSelection};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging (RUST_LOG=magstripe=trace for wire bytes)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ReaderConfig::from_env()?;
    println!("Connecting to {}...", config.device);

    let mut reader = Reader::new(config);
    reader.connect().await?;
    reader.initialize().await?;

    let info = reader.device_info().await?;
    println!("✓ Reader: {}", info);

    reader.authenticate().await?;
    println!("✓ Authenticated");

    reader.led(LedMode::Green).await?;
    println!("Insert a card...");
    reader.intake(Duration::from_secs(30)).await?;

    let tracks = reader.read_tracks(TrackSelection::all()).await?;
    for track in tracks.iter() {
        println!("  {}: {} ({} bytes)", track.track, track.status, track.len());
    }

    match CardDetails::from_tracks(&tracks) {
        Ok(card) => println!("✓ Card {} expires {}", card.masked_pan(), card.expiry),
        Err(e) => println!("✗ No ISO 7813 data: {}", e),
    }

    reader.withdraw(Duration::from_secs(30)).await?;
    reader.led(LedMode::Off).await?;
    reader.disconnect().await?;
    println!("✓ Disconnected");

    Ok(())
}
