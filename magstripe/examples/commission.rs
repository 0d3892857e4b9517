//! Master key commissioning example
//!
//! Imports a fresh master key into a reader that still has its factory key.
//! Set MAGSTRIPE_FACTORY_KEY_DEV or MAGSTRIPE_FACTORY_KEY_PROD and
//! MAGSTRIPE_READER_CLASS, then run with `--yes`.

use magstripe::{Reader, ReaderConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let confirmed = std::env::args().any(|arg| arg == "--yes");

    let config = ReaderConfig::from_env()?;
    println!(
        "Commissioning {} reader on {} (backup: {})",
        config.reader_class,
        config.device,
        config.backup_path.display()
    );

    let mut reader = Reader::new(config);
    reader.connect().await?;

    if let Err(e) = reader.provision_master_key(confirmed).await {
        reader.disconnect().await?;
        if matches!(e, magstripe::Error::ConfirmationRequired) {
            println!("This replaces the reader's master key. Re-run with --yes.");
            return Ok(());
        }
        return Err(e.into());
    }
    println!("✓ Master key imported");

    reader.authenticate().await?;
    println!("✓ Authenticated with the new key");

    reader.disconnect().await?;
    Ok(())
}
