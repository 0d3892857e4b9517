//! In-memory connector
//!
//! Hands out pre-created `tokio::io::duplex` links, so a simulated reader
//! can sit on the other end of a [`PortSession`](crate::PortSession).

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tracing::debug;

use crate::{error::*, BaudRate, Connector, Link};

/// Default in-memory buffer per direction
pub const DEFAULT_BUFFER: usize = 4096;

/// Connector backed by in-memory duplex streams
#[derive(Debug, Default)]
pub struct DuplexConnector {
    links: Mutex<VecDeque<DuplexStream>>,
    opened: Mutex<Vec<BaudRate>>,
}

impl DuplexConnector {
    /// Create a connector with no links queued
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a connector with one link queued, returning the device end
    pub fn pair() -> (Self, DuplexStream) {
        let connector = Self::new();
        let device = connector.add_link();
        (connector, device)
    }

    /// Queue another link, returning the device end
    pub fn add_link(&self) -> DuplexStream {
        let (host, device) = tokio::io::duplex(DEFAULT_BUFFER);
        self.links.lock().push_back(host);
        device
    }

    /// Baud rates requested so far, in order
    pub fn opened(&self) -> Vec<BaudRate> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn open(&self, baud: BaudRate) -> Result<Box<dyn Link>> {
        let link = self.links.lock().pop_front().ok_or_else(|| Error::PortOpenFailed {
            port: self.port_name(),
            reason: "no link queued".into(),
        })?;

        debug!("Opened in-memory link at {}", baud);
        self.opened.lock().push(baud);

        Ok(Box::new(link))
    }

    fn port_name(&self) -> String {
        "duplex".to_string()
    }
}
