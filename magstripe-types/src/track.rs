//! Track results
//!
//! A read yields up to three tracks. Each carries the reader's status code
//! and the decrypted bytes up to the `0x80` terminator.

use std::fmt;

use bitflags::bitflags;
use chrono::{DateTime, Utc};

use crate::error::*;

/// Logical end of decrypted track data
pub const TERMINATOR: u8 = 0x80;

/// Track number (1–3)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackNumber {
    One,
    Two,
    Three,
}

impl TrackNumber {
    pub const ALL: [TrackNumber; 3] = [Self::One, Self::Two, Self::Three];

    pub fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
        }
    }

    /// Maximum characters the track can hold
    pub fn capacity(self) -> usize {
        match self {
            Self::One => 79,
            Self::Two | Self::Three => 40,
        }
    }

    fn index(self) -> usize {
        self.number() as usize - 1
    }
}

impl TryFrom<u8> for TrackNumber {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            3 => Ok(Self::Three),
            _ => Err(Error::InvalidTrack(value)),
        }
    }
}

impl fmt::Display for TrackNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track {}", self.number())
    }
}

/// Per-track read status
///
/// The 2x codes are data, not errors: they say why a track is absent.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TrackStatus {
    Ok,
    NotRead,
    NoStartSentinel,
    ParityError,
    NoEndSentinel,
    LrcError,
    NoMagneticData,
    NoData,
    DataBlockOnly,
}

impl TrackStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::NotRead => 20,
            Self::NoStartSentinel => 21,
            Self::ParityError => 22,
            Self::NoEndSentinel => 23,
            Self::LrcError => 24,
            Self::NoMagneticData => 25,
            Self::NoData => 26,
            Self::DataBlockOnly => 27,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        Ok(match code.abs() {
            0 => Self::Ok,
            20 => Self::NotRead,
            21 => Self::NoStartSentinel,
            22 => Self::ParityError,
            23 => Self::NoEndSentinel,
            24 => Self::LrcError,
            25 => Self::NoMagneticData,
            26 => Self::NoData,
            27 => Self::DataBlockOnly,
            _ => return Err(Error::UnknownTrackStatus(code)),
        })
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Ok => "read",
            Self::NotRead => "not read",
            Self::NoStartSentinel => "no start sentinel",
            Self::ParityError => "parity error",
            Self::NoEndSentinel => "no end sentinel",
            Self::LrcError => "LRC error",
            Self::NoMagneticData => "no magnetic data",
            Self::NoData => "no data",
            Self::DataBlockOnly => "data block only",
        }
    }
}

impl fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// One track's result
#[derive(Clone, PartialEq, Eq)]
pub struct TrackData {
    pub track: TrackNumber,
    pub status: TrackStatus,
    data: Vec<u8>,
}

impl TrackData {
    /// Build from decrypted plaintext, cutting at the terminator
    ///
    /// Whatever follows `0x80` is padding and is dropped. The length is then
    /// that of a C string: the first NUL also ends the data.
    pub fn from_plaintext(track: TrackNumber, status: TrackStatus, plaintext: &[u8]) -> Result<Self> {
        let end = plaintext
            .iter()
            .position(|&b| b == TERMINATOR || b == 0)
            .unwrap_or(plaintext.len());

        if end > track.capacity() {
            return Err(Error::TrackTooLong {
                track: track.number(),
                len: end,
                max: track.capacity(),
            });
        }

        Ok(Self {
            track,
            status,
            data: plaintext[..end].to_vec(),
        })
    }

    /// Track that yielded nothing
    pub fn absent(track: TrackNumber, status: TrackStatus) -> Self {
        Self {
            track,
            status,
            data: Vec::new(),
        }
    }

    /// Check if the track holds data
    pub fn is_present(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Track characters as text
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

// Card data stays out of logs
impl fmt::Debug for TrackData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackData")
            .field("track", &self.track)
            .field("status", &self.status)
            .field("len", &self.data.len())
            .finish()
    }
}

bitflags! {
    /// Tracks to read
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct TrackSelection: u8 {
        const TRACK_1 = 0b001;
        const TRACK_2 = 0b010;
        const TRACK_3 = 0b100;
    }
}

impl TrackSelection {
    pub fn contains_track(self, track: TrackNumber) -> bool {
        self.contains(Self::from(track))
    }

    /// Selected tracks in ascending order
    pub fn tracks(self) -> impl Iterator<Item = TrackNumber> {
        TrackNumber::ALL.into_iter().filter(move |t| self.contains_track(*t))
    }
}

impl From<TrackNumber> for TrackSelection {
    fn from(track: TrackNumber) -> Self {
        match track {
            TrackNumber::One => Self::TRACK_1,
            TrackNumber::Two => Self::TRACK_2,
            TrackNumber::Three => Self::TRACK_3,
        }
    }
}

/// Result of one card read
#[derive(Debug, Clone)]
pub struct TrackSet {
    tracks: [Option<TrackData>; 3],
    pub read_at: DateTime<Utc>,
}

impl TrackSet {
    pub fn new() -> Self {
        Self {
            tracks: [None, None, None],
            read_at: Utc::now(),
        }
    }

    pub fn insert(&mut self, data: TrackData) {
        let index = data.track.index();
        self.tracks[index] = Some(data);
    }

    /// Result for `track`, `None` if it was not requested
    pub fn get(&self, track: TrackNumber) -> Option<&TrackData> {
        self.tracks[track.index()].as_ref()
    }

    /// Requested tracks in order
    pub fn iter(&self) -> impl Iterator<Item = &TrackData> {
        self.tracks.iter().flatten()
    }

    /// Check if any track holds data
    pub fn any_present(&self) -> bool {
        self.iter().any(TrackData::is_present)
    }
}

impl Default for TrackSet {
    fn default() -> Self {
        Self::new()
    }
}
