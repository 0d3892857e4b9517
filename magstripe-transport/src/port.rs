//! Port session: framed command execution over one serial link
//!
//! One `PortSession` owns one link to the reader. Three locks govern it:
//!
//! - the **command lock** guards the read half for the whole of an
//!   `execute`, so commands on a port never interleave;
//! - the **connect lock** serializes `connect`/`disconnect`, which also take
//!   the command lock so they cannot race an in-flight command;
//! - the **cancel lock** serializes `cancel`, which writes `DLE EOT` through
//!   the short-held writer lock without waiting for the command lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use magstripe_core::{
    constants::{
        control, ACK_TIMEOUT, CANCEL_TIMEOUT, MAX_DATA_SIZE, MAX_RECEIVE_RETRIES, MAX_SEND_RETRIES,
        SHORT_REPLY_GRACE,
    },
    frame::{self, CRC_SIZE, HEADER_SIZE, MAX_BODY_SIZE},
    CommandFrame, Reply,
};
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::{error::*, BaudRate, Connector, Link};

type Reader = ReadHalf<Box<dyn Link>>;
type Writer = WriteHalf<Box<dyn Link>>;

/// What a `cancel` call achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// DLE EOT sent, no command was waiting for its echo
    Sent,
    /// DLE EOT sent and echoed by the reader
    Acknowledged,
    /// Another cancel was already running
    AlreadyInProgress,
}

/// Session on one reader port
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use magstripe_core::Operation;
/// use magstripe_transport::{PortSession, SerialConnector};
///
/// # async fn run() -> magstripe_transport::Result<()> {
/// let port = PortSession::new(SerialConnector::new("/dev/ttyS1"));
/// port.connect(38400).await?;
///
/// let command = Operation::Init.encode(Vec::new())?;
/// let reply = port.execute(&command, Duration::from_secs(10)).await?;
/// println!("status {}", reply.status_code());
///
/// port.disconnect().await?;
/// # Ok(())
/// # }
/// ```
pub struct PortSession {
    connector: Box<dyn Connector>,
    baud: SyncMutex<Option<BaudRate>>,

    connect_lock: Mutex<()>,
    command_lock: Mutex<Option<Reader>>,
    writer: Mutex<Option<Writer>>,
    cancel_lock: Mutex<()>,

    connected: AtomicBool,
    cancel_in_progress: AtomicBool,
    cancel_ack_expected: AtomicBool,
    cancel_epoch: AtomicU64,

    cancel_requested: Notify,
    cancel_acked: Notify,

    ack_timeout: Duration,
    cancel_timeout: Duration,
}

impl PortSession {
    /// Create a disconnected session on `connector`
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            baud: SyncMutex::new(None),
            connect_lock: Mutex::new(()),
            command_lock: Mutex::new(None),
            writer: Mutex::new(None),
            cancel_lock: Mutex::new(()),
            connected: AtomicBool::new(false),
            cancel_in_progress: AtomicBool::new(false),
            cancel_ack_expected: AtomicBool::new(false),
            cancel_epoch: AtomicU64::new(0),
            cancel_requested: Notify::new(),
            cancel_acked: Notify::new(),
            ack_timeout: ACK_TIMEOUT,
            cancel_timeout: CANCEL_TIMEOUT,
        }
    }

    /// Set ACK wait per send
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set cancel echo wait
    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Device name of the underlying connector
    pub fn port_name(&self) -> String {
        self.connector.port_name()
    }

    /// Baud rate of the open link
    pub fn baud_rate(&self) -> Option<BaudRate> {
        *self.baud.lock()
    }

    /// Open the link
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBaudRate`] for rates other than 9600/19200/38400/115200
    /// - [`Error::AlreadyConnected`] if the session is open
    /// - [`Error::PortOpenFailed`] if the device cannot be opened
    pub async fn connect(&self, baud: u32) -> Result<()> {
        let baud = BaudRate::try_from(baud)?;

        let _connect = self.connect_lock.lock().await;
        let mut reader = self.command_lock.lock().await;

        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }

        info!("Connecting to {} at {}...", self.port_name(), baud);

        let link = self.connector.open(baud).await?;
        let (read_half, write_half) = tokio::io::split(link);

        *reader = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        *self.baud.lock() = Some(baud);
        self.connected.store(true, Ordering::Release);

        info!("Connected to {}", self.port_name());
        Ok(())
    }

    /// Close the link
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if the session is not open.
    pub async fn disconnect(&self) -> Result<()> {
        let _connect = self.connect_lock.lock().await;
        let mut reader = self.command_lock.lock().await;

        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        info!("Disconnecting from {}...", self.port_name());

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Shutdown of {} failed: {}", self.port_name(), e);
            }
        }
        reader.take();
        *self.baud.lock() = None;
        self.connected.store(false, Ordering::Release);

        info!("Disconnected");
        Ok(())
    }

    /// Send a command and wait up to `timeout` for its reply
    ///
    /// Holds the command lock for the whole exchange. Input left over from
    /// an earlier exchange is discarded before sending. The ACK wait uses a
    /// fixed short timeout per send; `timeout` bounds each reply reception.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Frame`] without sending if the payload exceeds the
    /// protocol's data limit.
    pub async fn execute(&self, command: &CommandFrame, timeout: Duration) -> Result<Reply> {
        if command.payload.len() > MAX_DATA_SIZE {
            return Err(magstripe_core::Error::PayloadTooLarge {
                size: command.payload.len(),
                max: MAX_DATA_SIZE,
            }
            .into());
        }

        let mut guard = self.command_lock.lock().await;
        let reader = guard.as_mut().ok_or(Error::NotConnected)?;
        let _expecting = FlagGuard::raise(&self.cancel_ack_expected);
        let exchange = Exchange {
            epoch: self.cancel_epoch.load(Ordering::Acquire),
        };

        debug!("Executing {}", command);

        self.drain_input(reader).await?;

        let frame = command.encode();
        self.send_frame(reader, &frame, exchange).await?;
        let reply = self.receive_reply(reader, timeout, exchange).await?;

        debug!("Reply to {}: {:?}", command, reply);
        Ok(reply)
    }

    /// Ask the reader to abort the running command
    ///
    /// Safe to call from another task while `execute` is blocked. Waits up
    /// to the cancel timeout for the `DLE EOT` echo only if a command is in
    /// flight.
    pub async fn cancel(&self) -> Result<CancelOutcome> {
        let Ok(_cancel) = self.cancel_lock.try_lock() else {
            debug!("Cancel already in progress");
            return Ok(CancelOutcome::AlreadyInProgress);
        };

        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if self.cancel_in_progress.swap(true, Ordering::AcqRel) {
            return Ok(CancelOutcome::AlreadyInProgress);
        }
        let _in_progress = FlagGuard::adopt(&self.cancel_in_progress);
        self.cancel_epoch.fetch_add(1, Ordering::AcqRel);

        let acked = self.cancel_acked.notified();
        tokio::pin!(acked);
        acked.as_mut().enable();

        info!("Sending cancel to {}", self.port_name());
        self.write(&[control::DLE, control::EOT]).await?;
        self.cancel_requested.notify_waiters();

        if !self.cancel_ack_expected.load(Ordering::Acquire) {
            return Ok(CancelOutcome::Sent);
        }

        match timeout(self.cancel_timeout, acked).await {
            Ok(()) => {
                debug!("Cancel acknowledged");
                Ok(CancelOutcome::Acknowledged)
            }
            Err(_) => {
                warn!("No cancel echo within {:?}", self.cancel_timeout);
                Err(Error::CancelTimeout)
            }
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;

        trace!("Sending {} bytes: {}", bytes.len(), hex::encode_upper(&bytes[..bytes.len().min(32)]));

        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Discard whatever is already buffered on the link
    async fn drain_input(&self, reader: &mut Reader) -> Result<()> {
        let mut chunk = [0u8; 256];
        let mut discarded = 0;

        while let Ok(read) = timeout(Duration::ZERO, reader.read(&mut chunk)).await {
            match read? {
                0 => return Err(Error::ConnectionClosed),
                n => discarded += n,
            }
        }

        if discarded > 0 {
            debug!("Discarded {} stale bytes", discarded);
        }
        Ok(())
    }

    /// Send `frame` until ACKed, at most `1 + MAX_SEND_RETRIES` times
    async fn send_frame(&self, reader: &mut Reader, frame: &[u8], exchange: Exchange) -> Result<()> {
        let attempts = 1 + MAX_SEND_RETRIES;
        let mut nak_last = false;

        for attempt in 1..=attempts {
            self.write(frame).await?;

            match self.wait_ack(reader, exchange).await? {
                Some(true) => {
                    trace!(attempt, "ACK received");
                    return Ok(());
                }
                Some(false) => {
                    warn!(attempt, "NAK received");
                    nak_last = true;
                }
                None => {
                    warn!(attempt, "ACK timeout after {:?}", self.ack_timeout);
                    nak_last = false;
                }
            }
        }

        Err(if nak_last {
            Error::NakOverLimit { attempts }
        } else {
            Error::AckTimeout { attempts }
        })
    }

    /// `Some(true)` on ACK, `Some(false)` on NAK, `None` on timeout
    async fn wait_ack(&self, reader: &mut Reader, exchange: Exchange) -> Result<Option<bool>> {
        let deadline = Instant::now() + self.ack_timeout;

        loop {
            let byte = match tokio::time::timeout_at(deadline, reader.read_u8()).await {
                Ok(byte) => byte.map_err(eof_as_closed)?,
                Err(_) => return Ok(None),
            };

            match byte {
                control::ACK => return Ok(Some(true)),
                control::NAK => return Ok(Some(false)),
                control::DLE => self.expect_cancel_echo(reader, exchange).await?,
                other => trace!("Skipping 0x{:02X} while waiting for ACK", other),
            }
        }
    }

    /// Read frames until one passes its CRC, NAKing bad ones
    async fn receive_reply(&self, reader: &mut Reader, timeout: Duration, exchange: Exchange) -> Result<Reply> {
        let attempts = 1 + MAX_RECEIVE_RETRIES;

        for attempt in 1..=attempts {
            let mut deadline = Deadline::after(timeout);
            let raw = self.read_frame(reader, &mut deadline, exchange).await?;

            trace!("Received {} bytes: {}", raw.len(), hex::encode_upper(&raw[..raw.len().min(32)]));

            match Reply::decode(&raw) {
                Ok(reply) => {
                    self.write(&[control::ACK]).await?;
                    return Ok(reply);
                }
                Err(e) if e.is_frame_error() => {
                    warn!(attempt, "Bad reply frame: {}", e);
                    self.write(&[control::NAK]).await?;
                }
                Err(e) => {
                    // Intact frame with content we cannot interpret
                    self.write(&[control::ACK]).await?;
                    return Err(e.into());
                }
            }
        }

        Err(Error::FailedToReceiveReply { attempts })
    }

    /// Read one raw reply frame (STX through CRC)
    async fn read_frame(
        &self,
        reader: &mut Reader,
        deadline: &mut Deadline,
        exchange: Exchange,
    ) -> Result<BytesMut> {
        loop {
            match self.read_byte(reader, deadline).await? {
                control::STX => break,
                control::DLE => self.expect_cancel_echo(reader, exchange).await?,
                other => trace!("Skipping 0x{:02X} before STX", other),
            }
        }

        let header = [
            control::STX,
            self.read_byte(reader, deadline).await?,
            self.read_byte(reader, deadline).await?,
        ];
        let declared = frame::declared_len(&header)?;
        if declared > MAX_BODY_SIZE {
            return Err(Error::ReplyTooLarge(declared));
        }

        let total = HEADER_SIZE + declared + CRC_SIZE;
        let mut buf = BytesMut::with_capacity(total);
        buf.put_slice(&header);
        self.read_exact(reader, &mut buf, total, deadline).await?;

        Ok(buf)
    }

    /// Fill `buf` up to `want` bytes; one grace read before giving up
    async fn read_exact(
        &self,
        reader: &mut Reader,
        buf: &mut BytesMut,
        want: usize,
        deadline: &mut Deadline,
    ) -> Result<()> {
        let mut chunk = [0u8; 256];

        while buf.len() < want {
            let n = (want - buf.len()).min(chunk.len());

            match self.read_some(reader, &mut chunk[..n], deadline).await {
                Ok(read) => buf.put_slice(&chunk[..read]),
                Err(Error::ReplyTimeout) => {
                    debug!("Reply short by {} bytes, retrying read once", want - buf.len());

                    if let Ok(Ok(read)) = timeout(SHORT_REPLY_GRACE, reader.read(&mut chunk[..n])).await {
                        buf.put_slice(&chunk[..read]);
                        if buf.len() == want {
                            return Ok(());
                        }
                    }
                    return Err(Error::ShortReply {
                        expected: want,
                        actual: buf.len(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn read_byte(&self, reader: &mut Reader, deadline: &mut Deadline) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_some(reader, &mut byte, deadline).await?;
        Ok(byte[0])
    }

    /// Read at least one byte before `deadline`
    ///
    /// A cancel request shortens the deadline to the cancel timeout; expiry
    /// after a cancel reports `CommandCanceled` instead of `ReplyTimeout`.
    async fn read_some(&self, reader: &mut Reader, buf: &mut [u8], deadline: &mut Deadline) -> Result<usize> {
        loop {
            let requested = self.cancel_requested.notified();
            tokio::pin!(requested);
            requested.as_mut().enable();

            if self.cancel_in_progress.load(Ordering::Acquire) {
                deadline.cancel(self.cancel_timeout);
            }
            let at = deadline.at;
            let canceled = deadline.canceled;

            tokio::select! {
                biased;
                read = reader.read(buf) => {
                    return match read? {
                        0 => Err(Error::ConnectionClosed),
                        n => Ok(n),
                    };
                }
                _ = tokio::time::sleep_until(at) => {
                    return Err(if canceled { Error::CommandCanceled } else { Error::ReplyTimeout });
                }
                _ = &mut requested, if !canceled => {
                    debug!("Cancel requested while waiting for reply");
                }
            }
        }
    }

    /// After a DLE, the next byte must be EOT: the reader's cancel echo
    ///
    /// An echo only ends the exchange if a cancel was sent while it ran;
    /// a late echo of an earlier cancel is skipped.
    async fn expect_cancel_echo(&self, reader: &mut Reader, exchange: Exchange) -> Result<()> {
        let next = match timeout(self.ack_timeout, reader.read_u8()).await {
            Ok(byte) => byte.map_err(eof_as_closed)?,
            Err(_) => return Err(Error::ReplyTimeout),
        };

        if next != control::EOT {
            warn!("Expected EOT after DLE, got 0x{:02X}", next);
            return Ok(());
        }

        let canceled = self.cancel_in_progress.load(Ordering::Acquire)
            || self.cancel_epoch.load(Ordering::Acquire) != exchange.epoch;
        if canceled {
            info!("Command canceled by reader");
            self.cancel_acked.notify_waiters();
            Err(Error::CommandCanceled)
        } else {
            debug!("Skipping stale cancel echo");
            Ok(())
        }
    }
}

impl Drop for PortSession {
    fn drop(&mut self) {
        if self.is_connected() {
            warn!("Port session {} dropped while still connected", self.connector.port_name());
        }
    }
}

/// Cancel epoch observed when an exchange started
#[derive(Debug, Clone, Copy)]
struct Exchange {
    epoch: u64,
}

/// Reply deadline that a cancel request can pull in
#[derive(Debug)]
struct Deadline {
    at: Instant,
    canceled: bool,
}

impl Deadline {
    fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            canceled: false,
        }
    }

    fn cancel(&mut self, grace: Duration) {
        if !self.canceled {
            self.at = self.at.min(Instant::now() + grace);
            self.canceled = true;
        }
    }
}

/// Clears a flag when dropped
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }

    fn adopt(flag: &'a AtomicBool) -> Self {
        Self(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn eof_as_closed(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DuplexConnector, MockConnector};
    use magstripe_core::Operation;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio::io::DuplexStream;

    const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

    async fn connected() -> (PortSession, DuplexStream) {
        let (connector, device) = DuplexConnector::pair();
        let port = PortSession::new(connector);
        port.connect(38400).await.unwrap();
        (port, device)
    }

    /// Device side: read one command frame
    async fn read_command(device: &mut DuplexStream) -> Option<CommandFrame> {
        let mut header = [0u8; HEADER_SIZE];
        loop {
            device.read_exact(&mut header[..1]).await.ok()?;
            if header[0] == control::STX {
                break;
            }
        }
        device.read_exact(&mut header[1..]).await.ok()?;
        let len = u16::from_be_bytes([header[1], header[2]]) as usize;

        let mut raw = header.to_vec();
        raw.resize(HEADER_SIZE + len + CRC_SIZE, 0);
        device.read_exact(&mut raw[HEADER_SIZE..]).await.ok()?;

        Some(CommandFrame::decode(&raw).unwrap())
    }

    fn init() -> CommandFrame {
        Operation::Init.encode(Vec::new()).unwrap()
    }

    #[tokio::test]
    async fn test_execute_positive_reply() {
        let (port, mut device) = connected().await;

        let sim = tokio::spawn(async move {
            let command = read_command(&mut device).await.unwrap();
            device.write_all(&[control::ACK]).await.unwrap();

            let reply = Reply::positive(command.command_code, command.parameter_code, 0, &b"OK"[..]);
            device.write_all(&reply.encode()).await.unwrap();
            assert_eq!(device.read_u8().await.unwrap(), control::ACK);
            command
        });

        let reply = port.execute(&init(), REPLY_TIMEOUT).await.unwrap();
        assert_eq!(reply.status_code(), 0);
        assert_eq!(&reply.payload()[..], b"OK");
        assert_eq!(sim.await.unwrap(), init());
    }

    #[tokio::test]
    async fn test_execute_negative_reply() {
        let (port, mut device) = connected().await;

        tokio::spawn(async move {
            let command = read_command(&mut device).await.unwrap();
            device.write_all(&[control::ACK]).await.unwrap();
            let reply = Reply::negative(command.command_code, command.parameter_code, 2, Vec::new());
            device.write_all(&reply.encode()).await.unwrap();
            device.read_u8().await.unwrap();
        });

        let reply = port.execute(&init(), REPLY_TIMEOUT).await.unwrap();
        assert_eq!(reply.status_code(), -2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout_sends_four_times() {
        let (port, mut device) = connected().await;

        let sim = tokio::spawn(async move {
            let mut sends = 0;
            while read_command(&mut device).await.is_some() {
                sends += 1;
            }
            sends
        });

        let result = port.execute(&init(), REPLY_TIMEOUT).await;
        assert!(matches!(result, Err(Error::AckTimeout { attempts: 4 })));

        port.disconnect().await.unwrap();
        assert_eq!(sim.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_nak_over_limit() {
        let (port, mut device) = connected().await;

        let sim = tokio::spawn(async move {
            let mut sends = 0;
            while read_command(&mut device).await.is_some() {
                sends += 1;
                device.write_all(&[control::NAK]).await.unwrap();
            }
            sends
        });

        let result = port.execute(&init(), REPLY_TIMEOUT).await;
        assert!(matches!(result, Err(Error::NakOverLimit { attempts: 4 })));
        assert!(result.unwrap_err().is_retryable());

        port.disconnect().await.unwrap();
        assert_eq!(sim.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_nak_then_ack() {
        let (port, mut device) = connected().await;

        tokio::spawn(async move {
            let first = read_command(&mut device).await.unwrap();
            device.write_all(&[control::NAK]).await.unwrap();
            let second = read_command(&mut device).await.unwrap();
            assert_eq!(first, second);

            device.write_all(&[control::ACK]).await.unwrap();
            let reply = Reply::positive(second.command_code, second.parameter_code, 0, Vec::new());
            device.write_all(&reply.encode()).await.unwrap();
            device.read_u8().await.unwrap();
        });

        assert!(port.execute(&init(), REPLY_TIMEOUT).await.is_ok());
    }

    #[tokio::test]
    async fn test_crc_mismatch_is_naked_and_received_again() {
        let (port, mut device) = connected().await;

        tokio::spawn(async move {
            let command = read_command(&mut device).await.unwrap();
            device.write_all(&[control::ACK]).await.unwrap();

            let good = Reply::positive(command.command_code, command.parameter_code, 25, vec![7u8; 4]).encode();
            let mut bad = good.clone();
            let last = bad.len() - 1;
            bad[last] ^= 0x5A;

            device.write_all(&bad).await.unwrap();
            assert_eq!(device.read_u8().await.unwrap(), control::NAK);
            device.write_all(&good).await.unwrap();
            assert_eq!(device.read_u8().await.unwrap(), control::ACK);
        });

        let reply = port.execute(&init(), REPLY_TIMEOUT).await.unwrap();
        assert_eq!(reply.status_code(), 25);
    }

    #[tokio::test]
    async fn test_crc_failure_exhausts_receive_retries() {
        let (port, mut device) = connected().await;

        let sim = tokio::spawn(async move {
            let command = read_command(&mut device).await.unwrap();
            device.write_all(&[control::ACK]).await.unwrap();

            let mut bad = Reply::positive(command.command_code, command.parameter_code, 0, Vec::new()).encode();
            let last = bad.len() - 1;
            bad[last] ^= 0xFF;

            let mut naks = 0;
            for _ in 0..4 {
                device.write_all(&bad).await.unwrap();
                if device.read_u8().await.unwrap() == control::NAK {
                    naks += 1;
                }
            }
            naks
        });

        let result = port.execute(&init(), REPLY_TIMEOUT).await;
        assert!(matches!(result, Err(Error::FailedToReceiveReply { attempts: 4 })));
        assert_eq!(sim.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_noise_before_stx_is_skipped() {
        let (port, mut device) = connected().await;

        tokio::spawn(async move {
            let command = read_command(&mut device).await.unwrap();
            device.write_all(&[0x00, control::ACK]).await.unwrap();
            device.write_all(&[0xFF, 0x00]).await.unwrap();
            let reply = Reply::positive(command.command_code, command.parameter_code, 0, Vec::new());
            device.write_all(&reply.encode()).await.unwrap();
            device.read_u8().await.unwrap();
        });

        assert!(port.execute(&init(), REPLY_TIMEOUT).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_reply() {
        let (port, mut device) = connected().await;

        let _sim = tokio::spawn(async move {
            read_command(&mut device).await.unwrap();
            device.write_all(&[control::ACK]).await.unwrap();
            // Declares 20 bytes, delivers 5
            device.write_all(&[control::STX, 0x00, 0x14, b'P', 0x30, 0x30, b'0', b'0']).await.unwrap();
            // Keep the link open
            let mut sink = Vec::new();
            let _ = device.read_to_end(&mut sink).await;
        });

        let result = port.execute(&init(), Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(Error::ShortReply { expected: 25, actual: 8 })
        ));
    }

    #[tokio::test]
    async fn test_reply_too_large() {
        let (port, mut device) = connected().await;

        tokio::spawn(async move {
            read_command(&mut device).await.unwrap();
            device.write_all(&[control::ACK, control::STX, 0xFF, 0xFF]).await.unwrap();
            let mut sink = Vec::new();
            let _ = device.read_to_end(&mut sink).await;
        });

        let result = port.execute(&init(), REPLY_TIMEOUT).await;
        assert!(matches!(result, Err(Error::ReplyTooLarge(0xFFFF))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_timeout() {
        let (port, mut device) = connected().await;

        let _sim = tokio::spawn(async move {
            read_command(&mut device).await.unwrap();
            device.write_all(&[control::ACK]).await.unwrap();
            let mut sink = Vec::new();
            let _ = device.read_to_end(&mut sink).await;
        });

        let result = port.execute(&init(), Duration::from_secs(3)).await;
        assert!(matches!(result, Err(Error::ReplyTimeout)));
    }

    #[tokio::test]
    async fn test_concurrent_cancel() {
        let (port, mut device) = connected().await;
        let port = Arc::new(port);
        let (acked_tx, acked_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            read_command(&mut device).await.unwrap();
            device.write_all(&[control::ACK]).await.unwrap();
            acked_tx.send(()).unwrap();

            let mut cancel = [0u8; 2];
            device.read_exact(&mut cancel).await.unwrap();
            assert_eq!(cancel, [control::DLE, control::EOT]);
            device.write_all(&[control::DLE, control::EOT]).await.unwrap();

            let mut sink = Vec::new();
            let _ = device.read_to_end(&mut sink).await;
        });

        let executing = {
            let port = port.clone();
            tokio::spawn(async move {
                let intake = Operation::Intake
                    .encode(Operation::timeout_payload(Duration::from_secs(60)))
                    .unwrap();
                port.execute(&intake, Duration::from_secs(90)).await
            })
        };

        acked_rx.await.unwrap();
        let outcome = port.cancel().await.unwrap();

        let result = executing.await.unwrap();
        assert!(matches!(result, Err(Error::CommandCanceled)));
        assert_eq!(outcome, CancelOutcome::Acknowledged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_without_echo() {
        let (port, mut device) = connected().await;
        let port = Arc::new(port);
        let (acked_tx, acked_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            read_command(&mut device).await.unwrap();
            device.write_all(&[control::ACK]).await.unwrap();
            acked_tx.send(()).unwrap();
            // Swallow DLE EOT, never echo
            let mut sink = Vec::new();
            let _ = device.read_to_end(&mut sink).await;
        });

        let started = Instant::now();
        let executing = {
            let port = port.clone();
            tokio::spawn(async move { port.execute(&init(), Duration::from_secs(600)).await })
        };

        acked_rx.await.unwrap();
        let outcome = port.cancel().await;

        assert!(matches!(outcome, Err(Error::CancelTimeout)));
        assert!(matches!(executing.await.unwrap(), Err(Error::CommandCanceled)));
        assert!(started.elapsed() <= CANCEL_TIMEOUT + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancel_idle_port() {
        let (port, mut device) = connected().await;

        assert_eq!(port.cancel().await.unwrap(), CancelOutcome::Sent);

        let mut cancel = [0u8; 2];
        device.read_exact(&mut cancel).await.unwrap();
        assert_eq!(cancel, [control::DLE, control::EOT]);
    }

    /// Device side: ACK `command` and answer it positively
    async fn serve(device: &mut DuplexStream, command: &CommandFrame) {
        let reply = Reply::positive(command.command_code, command.parameter_code, 0, Vec::new());
        device.write_all(&reply.encode()).await.unwrap();
        assert_eq!(device.read_u8().await.unwrap(), control::ACK);
    }

    #[tokio::test]
    async fn test_execute_after_idle_cancel_echo() {
        let (port, mut device) = connected().await;
        let (echoed_tx, echoed_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let mut cancel = [0u8; 2];
            device.read_exact(&mut cancel).await.unwrap();
            device.write_all(&[control::DLE, control::EOT]).await.unwrap();
            echoed_tx.send(()).unwrap();

            let command = read_command(&mut device).await.unwrap();
            device.write_all(&[control::ACK]).await.unwrap();
            serve(&mut device, &command).await;
        });

        assert_eq!(port.cancel().await.unwrap(), CancelOutcome::Sent);
        echoed_rx.await.unwrap();

        let reply = port.execute(&init(), REPLY_TIMEOUT).await.unwrap();
        assert_eq!(reply.status_code(), 0);
    }

    #[tokio::test]
    async fn test_late_cancel_echo_is_skipped() {
        let (port, mut device) = connected().await;

        tokio::spawn(async move {
            let mut cancel = [0u8; 2];
            device.read_exact(&mut cancel).await.unwrap();

            // Echo arrives only once the next command is on the wire
            let command = read_command(&mut device).await.unwrap();
            device.write_all(&[control::DLE, control::EOT, control::ACK]).await.unwrap();
            serve(&mut device, &command).await;
        });

        assert_eq!(port.cancel().await.unwrap(), CancelOutcome::Sent);

        let reply = port.execute(&init(), REPLY_TIMEOUT).await.unwrap();
        assert_eq!(reply.status_code(), 0);
    }

    #[tokio::test]
    async fn test_execute_after_reply_too_large() {
        let (port, mut device) = connected().await;

        tokio::spawn(async move {
            read_command(&mut device).await.unwrap();

            // Declares 1040 bytes, body full of ACK and NAK bytes
            let mut oversized = vec![control::ACK, control::STX, 0x04, 0x10];
            oversized.extend(std::iter::repeat_n([control::ACK, control::NAK], 521).flatten());
            device.write_all(&oversized).await.unwrap();

            let command = read_command(&mut device).await.unwrap();
            device.write_all(&[control::ACK]).await.unwrap();
            serve(&mut device, &command).await;
        });

        let result = port.execute(&init(), REPLY_TIMEOUT).await;
        assert!(matches!(result, Err(Error::ReplyTooLarge(1040))));

        let reply = port.execute(&init(), REPLY_TIMEOUT).await.unwrap();
        assert_eq!(reply.status_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_reply_completed_within_grace() {
        let (port, mut device) = connected().await;

        tokio::spawn(async move {
            let command = read_command(&mut device).await.unwrap();
            device.write_all(&[control::ACK]).await.unwrap();

            let reply = Reply::positive(command.command_code, command.parameter_code, 0, &b"DATA"[..]).encode();
            device.write_all(&reply[..6]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1200)).await;
            device.write_all(&reply[6..]).await.unwrap();
            assert_eq!(device.read_u8().await.unwrap(), control::ACK);
        });

        let reply = port.execute(&init(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(&reply.payload()[..], b"DATA");
    }

    #[tokio::test]
    async fn test_oversized_payload_is_not_sent() {
        let (port, mut device) = connected().await;

        let command = CommandFrame::with_payload(0x30, 0x30, vec![0u8; 70_000]);
        let result = port.execute(&command, REPLY_TIMEOUT).await;

        assert!(matches!(
            result,
            Err(Error::Frame(magstripe_core::Error::PayloadTooLarge { size: 70_000, max: 1024 }))
        ));

        port.disconnect().await.unwrap();
        let mut sent = Vec::new();
        device.read_to_end(&mut sent).await.unwrap();
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn test_execute_not_connected() {
        let port = PortSession::new(DuplexConnector::new());
        let result = port.execute(&init(), REPLY_TIMEOUT).await;
        assert!(matches!(result, Err(Error::NotConnected)));
        assert!(matches!(port.cancel().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_twice() {
        let connector = DuplexConnector::new();
        let _first = connector.add_link();
        let _second = connector.add_link();
        let port = PortSession::new(connector);

        port.connect(9600).await.unwrap();
        assert!(matches!(port.connect(9600).await, Err(Error::AlreadyConnected)));
        assert_eq!(port.baud_rate(), Some(BaudRate::B9600));

        port.disconnect().await.unwrap();
        assert!(matches!(port.disconnect().await, Err(Error::NotConnected)));
        assert_eq!(port.baud_rate(), None);

        // Reconnect after disconnect
        port.connect(115200).await.unwrap();
        assert!(port.is_connected());
        port.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_invalid_baud() {
        let (connector, _device) = DuplexConnector::pair();
        let port = PortSession::new(connector);

        assert!(matches!(port.connect(57600).await, Err(Error::InvalidBaudRate(57600))));
        assert!(!port.is_connected());
    }

    #[tokio::test]
    async fn test_connect_open_failure() {
        let mut connector = MockConnector::new();
        connector.expect_open().times(1).returning(|_| {
            Err(Error::PortOpenFailed {
                port: "/dev/ttyS9".into(),
                reason: "permission denied".into(),
            })
        });
        connector.expect_port_name().return_const("/dev/ttyS9".to_string());

        let port = PortSession::new(connector);
        let result = port.connect(19200).await;

        assert!(matches!(result, Err(Error::PortOpenFailed { .. })));
        assert!(!port.is_connected());
    }

    #[tokio::test]
    async fn test_commands_do_not_interleave() {
        let (port, mut device) = connected().await;
        let port = Arc::new(port);

        let sim = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..2 {
                let command = read_command(&mut device).await.unwrap();
                device.write_all(&[control::ACK]).await.unwrap();
                tokio::task::yield_now().await;
                let reply = Reply::positive(command.command_code, command.parameter_code, 0, Vec::new());
                device.write_all(&reply.encode()).await.unwrap();
                assert_eq!(device.read_u8().await.unwrap(), control::ACK);
                seen.push(command.operation().unwrap());
            }
            seen
        });

        let a = {
            let port = port.clone();
            tokio::spawn(async move { port.execute(&init(), REPLY_TIMEOUT).await })
        };
        let b = {
            let port = port.clone();
            let reset = Operation::Reset.encode(Vec::new()).unwrap();
            tokio::spawn(async move { port.execute(&reset, REPLY_TIMEOUT).await })
        };

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());

        let mut seen = sim.await.unwrap();
        seen.sort_by_key(|op| op.code());
        assert_eq!(seen, vec![Operation::Init, Operation::Reset]);
    }
}
