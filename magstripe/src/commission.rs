//! Master key commissioning
//!
//! A new reader only knows the temporary factory key of its class. The host
//! generates Km, saves it locally, then imports it wrapped under that
//! factory key. The backup is written before anything is sent.

use std::path::Path;

use magstripe_core::{crypto::KEY_SIZE, DesKey};
use tracing::info;
use zeroize::Zeroizing;

use crate::error::Result;

/// A freshly generated master key awaiting import
pub(crate) struct MasterKeyImport {
    key: DesKey,
}

impl MasterKeyImport {
    pub fn new() -> Result<Self> {
        Ok(Self {
            key: DesKey::generate()?,
        })
    }

    /// Write the key as hex to `path`, replacing any previous backup
    pub async fn backup(&self, path: &Path) -> Result<()> {
        let mut contents = Zeroizing::new(self.key.to_hex());
        contents.push('\n');
        tokio::fs::write(path, contents.as_bytes()).await?;

        info!("Master key backup written to {}", path.display());
        Ok(())
    }

    /// `IMPORT_MASTER_KEY` payload: Km under the factory key
    pub fn payload(&self, factory: &DesKey) -> Result<[u8; KEY_SIZE]> {
        Ok(factory.wrap(&self.key)?)
    }

    pub fn into_key(self) -> DesKey {
        self.key
    }
}

/// Read a master key backup written by commissioning
pub async fn read_backup(path: &Path) -> Result<DesKey> {
    let contents = Zeroizing::new(tokio::fs::read_to_string(path).await?);
    Ok(DesKey::from_hex(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_backup_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("MASTERKey.TXT");

        let import = MasterKeyImport::new().unwrap();
        import.backup(&path).await.unwrap();

        let restored = read_backup(&path).await.unwrap();
        assert_eq!(restored, import.into_key());
    }

    #[test]
    fn test_payload_unwraps_under_factory_key() {
        let factory = DesKey::generate().unwrap();
        let import = MasterKeyImport::new().unwrap();

        let payload = import.payload(&factory).unwrap();
        assert_eq!(factory.unwrap_key(&payload).unwrap(), import.into_key());
    }
}
