//! High-level reader interface

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use magstripe_core::{Operation, Reply, Session};
use magstripe_transport::{self as transport, CancelOutcome, Connector, PortSession, SerialConnector};
use magstripe_types::{device_info::ascii_field, DeviceInfo, FirmwareVersions, TrackSelection, TrackSet};

use crate::auth::Handshake;
use crate::codec::{self, Decoded};
use crate::commission::MasterKeyImport;
use crate::config::ReaderConfig;
use crate::error::{Error, Result};
use crate::tracks::{self, TrackLadder};

/// Indicator LED setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedMode {
    Off,
    Green,
    Red,
    Blink,
}

impl LedMode {
    fn code(self) -> u8 {
        match self {
            Self::Off => b'0',
            Self::Green => b'1',
            Self::Red => b'2',
            Self::Blink => b'3',
        }
    }
}

/// Cancels the running command from another task
#[derive(Clone)]
pub struct CancelHandle {
    port: Arc<PortSession>,
}

impl CancelHandle {
    /// Send DLE EOT and wait for the reader's echo
    pub async fn cancel(&self) -> Result<CancelOutcome> {
        Ok(self.port.cancel().await?)
    }
}

/// Secure magnetic-stripe card reader
///
/// # Examples
///
/// ```no_run
/// use magstripe::{Reader, ReaderConfig, TrackSelection};
///
/// #[tokio::main]
/// async fn main() -> magstripe::Result<()> {
///     let mut reader = Reader::new(ReaderConfig::from_env()?);
///
///     reader.connect().await?;
///     reader.initialize().await?;
///     reader.authenticate().await?;
///
///     let tracks = reader.read_tracks(TrackSelection::all()).await?;
///     for track in tracks.iter() {
///         println!("{}: {}", track.track, track.status);
///     }
///
///     reader.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct Reader {
    port: Arc<PortSession>,
    session: Session,
    config: ReaderConfig,
}

impl Reader {
    /// Create a reader on the configured serial device
    pub fn new(config: ReaderConfig) -> Self {
        let connector = SerialConnector::new(config.device.clone());
        Self::with_connector(config, connector)
    }

    /// Create a reader on any connector
    pub fn with_connector(config: ReaderConfig, connector: impl Connector + 'static) -> Self {
        Self {
            port: Arc::new(PortSession::new(connector)),
            session: Session::new(),
            config,
        }
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Authentication state and counters
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.session.is_connected() && self.port.is_connected()
    }

    /// Check if mutual authentication has completed
    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    /// Handle for canceling commands from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            port: self.port.clone(),
        }
    }

    /// Open the serial port
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The configured baud rate is not supported
    /// - The port is already open
    /// - The device cannot be opened
    pub async fn connect(&mut self) -> Result<()> {
        info!("Connecting to reader on {}...", self.config.device);

        self.port.connect(self.config.baud_rate).await?;
        self.session.connect()?;

        info!("Reader connected");
        Ok(())
    }

    /// Close the serial port
    pub async fn disconnect(&mut self) -> Result<()> {
        self.port.disconnect().await?;
        self.session.close();

        info!("Reader disconnected");
        Ok(())
    }

    /// Initialize the reader mechanism
    pub async fn initialize(&self) -> Result<()> {
        debug!("Initializing reader...");
        self.command(Operation::Init, Bytes::new()).await?;
        self.session.revoke();
        Ok(())
    }

    /// Reset the reader
    pub async fn reset(&self) -> Result<()> {
        warn!("Resetting reader...");
        self.command(Operation::Reset, Bytes::new()).await?;
        self.session.revoke();
        Ok(())
    }

    /// Wait up to `timeout` for a card to be inserted
    pub async fn intake(&self, timeout: Duration) -> Result<i32> {
        debug!("Waiting {:?} for card intake...", timeout);
        self.timed(Operation::Intake, timeout).await
    }

    /// Wait up to `timeout` for the card to be withdrawn
    pub async fn withdraw(&self, timeout: Duration) -> Result<i32> {
        debug!("Waiting {:?} for card withdrawal...", timeout);
        self.timed(Operation::Withdraw, timeout).await
    }

    /// Set the indicator LED
    pub async fn led(&self, mode: LedMode) -> Result<()> {
        self.command(Operation::Led, vec![mode.code()]).await?;
        Ok(())
    }

    /// Ask the reader to abort its pending mechanism command
    ///
    /// This is the framed `CANCEL_COMMAND`; use [`cancel_handle`](Self::cancel_handle)
    /// to interrupt a command that is still running on this port.
    pub async fn cancel_command(&self) -> Result<()> {
        self.command(Operation::CancelCommand, Bytes::new()).await?;
        Ok(())
    }

    /// Clear the secure CPU's tamper lock
    ///
    /// Wipes the reader's keys, so it needs commissioning afterwards.
    pub async fn zap_reader_lock(&self, confirmed: bool) -> Result<()> {
        if !confirmed {
            return Err(Error::ConfirmationRequired);
        }

        warn!("Zapping reader lock...");
        self.command(Operation::ZapReaderLock, Bytes::new()).await?;
        self.session.revoke();
        Ok(())
    }

    /// Get serial number, model and firmware versions
    pub async fn device_info(&self) -> Result<DeviceInfo> {
        debug!("Getting device info...");

        let serial = self.command(Operation::InfoSerialNumber, Bytes::new()).await?;
        let model = self.command(Operation::InfoModel, Bytes::new()).await?;
        let firmware = self.firmware_versions().await?;

        let info = DeviceInfo::new(ascii_field(&serial.payload), ascii_field(&model.payload)).with_firmware(firmware);
        debug!("Device info: {}", info);
        Ok(info)
    }

    /// Query every CPU's firmware version
    ///
    /// The secure CPU is always queried; readers without one answer "not
    /// supported", which yields `None`.
    pub async fn firmware_versions(&self) -> Result<FirmwareVersions> {
        Ok(FirmwareVersions {
            super_cpu: self.firmware(Operation::FirmwareSuper).await?,
            user: self.firmware(Operation::FirmwareUser).await?,
            emv2000: self.firmware(Operation::FirmwareEmv2000).await?,
            sec_super: self.firmware(Operation::FirmwareSecSuper).await?,
            sec_user: self.firmware(Operation::FirmwareSecUser).await?,
        })
    }

    /// Mutually authenticate with the reader's secure CPU
    ///
    /// Runs the whole Ke/Kwa/challenge ceremony. Any failure leaves the
    /// session unauthenticated; there is no automatic retry.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no master key is configured
    /// - [`Error::Rejected`] if the reader refuses a step
    /// - [`Error::AuthenticationFailed`] if the reader's RndB echo is wrong
    pub async fn authenticate(&self) -> Result<()> {
        self.ensure_connected()?;
        let master = self.master_key()?;

        info!("Authenticating reader...");
        self.session.revoke();

        let handshake = Handshake::new()?;
        self.command(Operation::SendKeKey, handshake.ke_payload(master)?.to_vec()).await?;
        self.command(Operation::SendKwaKey, handshake.kwa_payload()?.to_vec()).await?;

        let challenge = self.command(Operation::GetChallenge, Bytes::new()).await?;
        let response = handshake.respond(&challenge.payload)?;

        let echo = self.command(Operation::DeviceAuth, response.to_vec()).await?;
        handshake.verify(&echo.payload)?;

        self.session.authenticate()?;
        info!("Reader authenticated (#{})", self.session.authentications());
        Ok(())
    }

    /// Read and decrypt the selected tracks
    ///
    /// Each track gets a fresh key ladder. A track the reader could not read
    /// comes back absent with its status; that is not an error.
    pub async fn read_tracks(&self, selection: TrackSelection) -> Result<TrackSet> {
        self.ensure_connected()?;
        if !self.session.is_authenticated() {
            return Err(Error::NotAuthenticated);
        }
        let master = self.master_key()?;

        let mut tracks = TrackSet::new();
        for track in selection.tracks() {
            debug!("Reading {}...", track);

            let ladder = TrackLadder::new()?;
            self.command(Operation::SendMagDataKe, ladder.ke_payload(master)?.to_vec()).await?;
            self.command(Operation::SendMagDataKey, ladder.kwm_payload()?.to_vec()).await?;
            self.session.record_track_session();

            let operation = tracks::read_operation(track);
            let reply = self.exchange(operation, Bytes::new(), self.config.command_timeout).await??;
            tracks.insert(ladder.track_result(track, codec::decode(operation, &reply))?);
        }

        Ok(tracks)
    }

    /// Generate a new master key and import it into the reader
    ///
    /// The key is saved to the configured backup file first. On success it
    /// replaces the configured master key and the session must
    /// authenticate again.
    ///
    /// # Errors
    ///
    /// - [`Error::ConfirmationRequired`] unless `confirmed`
    /// - [`Error::Config`] if the reader class has no factory key
    /// - [`Error::Io`] if the backup cannot be written (nothing is sent)
    pub async fn provision_master_key(&mut self, confirmed: bool) -> Result<()> {
        if !confirmed {
            return Err(Error::ConfirmationRequired);
        }
        self.ensure_connected()?;
        let factory = self.config.factory_key()?;

        let import = MasterKeyImport::new()?;
        import.backup(&self.config.backup_path).await?;

        warn!("Importing new master key ({} reader)...", self.config.reader_class);
        self.command(Operation::ImportMasterKey, import.payload(factory)?.to_vec()).await?;

        self.config.master_key = Some(import.into_key());
        self.session.revoke();

        info!("Master key imported");
        Ok(())
    }

    /// Run `operation` and return its signed outcome code
    ///
    /// Positive replies give their status, negative replies and transport
    /// failures give a negative code. Only invalid request payloads and a
    /// closed port are errors.
    pub async fn status_of(&self, operation: Operation, payload: impl Into<Bytes>) -> Result<i32> {
        let result = self
            .exchange(operation, payload.into(), self.config.command_timeout)
            .await?;
        Ok(codec::status_code(&codec::outcome(operation, &result)))
    }

    // Helper methods

    fn ensure_connected(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    fn master_key(&self) -> Result<&magstripe_core::DesKey> {
        self.config
            .master_key
            .as_ref()
            .ok_or_else(|| Error::Config("no master key configured".into()))
    }

    async fn firmware(&self, operation: Operation) -> Result<Option<String>> {
        match self.command(operation, Bytes::new()).await {
            Ok(decoded) => Ok(Some(ascii_field(&decoded.payload))),
            Err(e) if e.is_not_supported() => {
                debug!("{} not supported", operation);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn timed(&self, operation: Operation, timeout: Duration) -> Result<i32> {
        let payload = Operation::timeout_payload(timeout);
        let reply = self
            .exchange(operation, payload, timeout + self.config.command_timeout)
            .await??;
        let decoded = codec::decode(operation, &reply).map_err(|code| Error::Rejected { operation, code })?;
        Ok(decoded.status)
    }

    async fn command(&self, operation: Operation, payload: impl Into<Bytes>) -> Result<Decoded> {
        let reply = self
            .exchange(operation, payload.into(), self.config.command_timeout)
            .await??;
        codec::decode(operation, &reply).map_err(|code| Error::Rejected { operation, code })
    }

    async fn exchange(
        &self,
        operation: Operation,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<transport::Result<Reply>> {
        self.ensure_connected()?;
        let frame = operation.encode(payload)?;

        trace!("Sending: {}", frame);
        let result = self.port.execute(&frame, timeout).await;
        trace!("Result for {}: {:?}", operation, result.as_ref().map(Reply::status_code));

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magstripe_transport::DuplexConnector;

    #[test]
    fn test_reader_create() {
        let reader = Reader::new(ReaderConfig::new("/dev/ttyS1"));
        assert!(!reader.is_connected());
        assert!(!reader.is_authenticated());
    }

    #[test]
    fn test_led_codes() {
        assert_eq!(LedMode::Off.code(), b'0');
        assert_eq!(LedMode::Blink.code(), b'3');
    }

    #[tokio::test]
    async fn test_commands_need_connection() {
        let reader = Reader::with_connector(ReaderConfig::default(), DuplexConnector::new());

        assert!(matches!(reader.initialize().await, Err(Error::NotConnected)));
        assert!(matches!(reader.authenticate().await, Err(Error::NotConnected)));
        assert!(matches!(
            reader.read_tracks(TrackSelection::all()).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_confirmation_required() {
        let mut reader = Reader::with_connector(ReaderConfig::default(), DuplexConnector::new());

        assert!(matches!(
            reader.provision_master_key(false).await,
            Err(Error::ConfirmationRequired)
        ));
        assert!(matches!(
            reader.zap_reader_lock(false).await,
            Err(Error::ConfirmationRequired)
        ));
    }
}
