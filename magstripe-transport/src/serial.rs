//! RS-232C serial connector

use std::time::Duration;

use async_trait::async_trait;
use tokio_serial::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialStream, StopBits};
use tracing::{debug, warn};

use crate::{error::*, BaudRate, Connector, Link};

/// Serial connector for the card reader
///
/// Line settings follow the reader's defaults: 8 data bits, even parity,
/// one stop bit, RTS/CTS hardware flow control.
pub struct SerialConnector {
    device: String,
    parity: Parity,
    flow_control: FlowControl,
    settle_time: Duration,
}

impl SerialConnector {
    /// Create new serial connector for `device` (e.g. `/dev/ttyS1`)
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            parity: Parity::Even,
            flow_control: FlowControl::Hardware,
            settle_time: Duration::from_millis(100),
        }
    }

    /// Set parity
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Set delay between opening the port and flushing its input
    pub fn with_settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    fn open_failed(&self, reason: impl ToString) -> Error {
        Error::PortOpenFailed {
            port: self.device.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self, baud: BaudRate) -> Result<Box<dyn Link>> {
        debug!("Opening {} at {}...", self.device, baud);

        let builder = tokio_serial::new(&self.device, baud.as_u32())
            .data_bits(DataBits::Eight)
            .parity(self.parity)
            .stop_bits(StopBits::One)
            .flow_control(self.flow_control);

        let mut stream = SerialStream::open(&builder).map_err(|e| self.open_failed(e))?;

        if self.flow_control == FlowControl::None {
            if let Err(e) = stream.write_request_to_send(true) {
                warn!("Failed to assert RTS on {}: {}", self.device, e);
            }
        }

        tokio::time::sleep(self.settle_time).await;
        stream
            .clear(ClearBuffer::Input)
            .map_err(|e| self.open_failed(e))?;

        debug!("Opened {}", self.device);

        Ok(Box::new(stream))
    }

    fn port_name(&self) -> String {
        self.device.clone()
    }
}
