pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid track number: {0}")]
    InvalidTrack(u8),

    #[error("Unknown track status: {0}")]
    UnknownTrackStatus(i32),

    #[error("Track {track} data too long: {len} bytes (max {max})")]
    TrackTooLong { track: u8, len: usize, max: usize },

    #[error("Parse error: {0}")]
    Parse(String),
}
