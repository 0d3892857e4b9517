//! Reader session state
//!
//! A session tracks where the reader is in its security lifecycle:
//! - Link state (connected or not)
//! - Authentication state (mutual authentication completed)
//! - Counters for authentications and track-read key ladders

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Port closed
    Disconnected,

    /// Port open, reader not authenticated
    Connected,

    /// Mutual authentication completed
    Authenticated,
}

/// Session manager
///
/// Thread-safe and can be cloned cheaply (Arc internally).
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    /// Successful authentications since connect
    authentications: AtomicU32,

    /// Magnetic-data key ladders completed since connect
    track_sessions: AtomicU32,

    /// Current session state
    state: parking_lot::RwLock<SessionState>,
}

impl Session {
    /// Create a new disconnected session
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SessionInner {
                authentications: AtomicU32::new(0),
                track_sessions: AtomicU32::new(0),
                state: parking_lot::RwLock::new(SessionState::Disconnected),
            }),
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        !matches!(self.state(), SessionState::Disconnected)
    }

    /// Check if authenticated
    pub fn is_authenticated(&self) -> bool {
        matches!(self.state(), SessionState::Authenticated)
    }

    /// Mark the port as connected
    pub fn connect(&self) -> Result<()> {
        let mut state = self.inner.state.write();

        if *state != SessionState::Disconnected {
            return Err(Error::InvalidState(format!(
                "Cannot connect from state: {:?}",
                *state
            )));
        }

        self.inner.authentications.store(0, Ordering::Release);
        self.inner.track_sessions.store(0, Ordering::Release);
        *state = SessionState::Connected;

        Ok(())
    }

    /// Mark the reader as authenticated
    pub fn authenticate(&self) -> Result<()> {
        let mut state = self.inner.state.write();

        if *state != SessionState::Connected {
            return Err(Error::InvalidState(format!(
                "Cannot authenticate from state: {:?}",
                *state
            )));
        }

        self.inner.authentications.fetch_add(1, Ordering::AcqRel);
        *state = SessionState::Authenticated;
        Ok(())
    }

    /// Drop back to connected (reader reset or failed re-authentication)
    pub fn revoke(&self) {
        let mut state = self.inner.state.write();
        if *state == SessionState::Authenticated {
            *state = SessionState::Connected;
        }
    }

    /// Record a completed magnetic-data key ladder
    pub fn record_track_session(&self) -> u32 {
        self.inner.track_sessions.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Successful authentications since connect
    pub fn authentications(&self) -> u32 {
        self.inner.authentications.load(Ordering::Acquire)
    }

    /// Magnetic-data key ladders since connect
    pub fn track_sessions(&self) -> u32 {
        self.inner.track_sessions.load(Ordering::Acquire)
    }

    /// Close session
    pub fn close(&self) {
        *self.inner.state.write() = SessionState::Disconnected;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
