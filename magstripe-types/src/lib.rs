//! Data types for magnetic-stripe reader results

pub mod card;
pub mod device_info;
pub mod error;
pub mod track;

pub use card::CardDetails;
pub use device_info::{DeviceInfo, FirmwareVersions};
pub use error::{Error, Result};
pub use track::{TrackData, TrackNumber, TrackSelection, TrackSet, TrackStatus};
