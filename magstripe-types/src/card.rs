//! ISO/IEC 7813 financial card fields
//!
//! Track 1 (format B): `%B PAN ^ SURNAME/GIVEN ^ YYMM service discretionary ?`
//! Track 2: `; PAN = YYMM service discretionary ?`
//!
//! Start/end sentinels are optional; readers usually strip them.

use std::fmt;

use crate::{error::*, TrackData, TrackNumber, TrackSet};

const MAX_PAN_LEN: usize = 19;

/// Card fields parsed from track 1 or 2
#[derive(Clone, PartialEq, Eq)]
pub struct CardDetails {
    /// Primary account number
    pub pan: String,
    /// Cardholder name as encoded (`SURNAME/GIVEN`), track 1 only
    pub name: Option<String>,
    /// Expiry as `YY/MM`
    pub expiry: String,
    /// Three-digit service code
    pub service_code: Option<String>,
}

impl CardDetails {
    /// Parse a track 1 format B string
    pub fn from_track1(text: &str) -> Result<Self> {
        let body = strip_sentinels(text, '%');
        let body = match body.strip_prefix('B') {
            Some(rest) => rest,
            None if body.starts_with(|c: char| c.is_ascii_digit()) => body,
            None => return Err(Error::Parse("track 1 is not format B".into())),
        };

        let mut fields = body.splitn(3, '^');
        let pan = fields.next().unwrap_or_default();
        let name = fields
            .next()
            .ok_or_else(|| Error::Parse("track 1 missing name field".into()))?;
        let rest = fields
            .next()
            .ok_or_else(|| Error::Parse("track 1 missing expiry field".into()))?;

        let (expiry, service_code) = expiry_and_service(rest)?;

        Ok(Self {
            pan: validate_pan(pan)?,
            name: Some(name.trim_end().to_string()).filter(|n| !n.is_empty()),
            expiry,
            service_code,
        })
    }

    /// Parse a track 2 string
    pub fn from_track2(text: &str) -> Result<Self> {
        let body = strip_sentinels(text, ';');
        let (pan, rest) = body
            .split_once('=')
            .ok_or_else(|| Error::Parse("track 2 missing '=' separator".into()))?;

        let (expiry, service_code) = expiry_and_service(rest)?;

        Ok(Self {
            pan: validate_pan(pan)?,
            name: None,
            expiry,
            service_code,
        })
    }

    /// Parse from a track result, track 1 or 2 only
    pub fn from_track(track: &TrackData) -> Result<Self> {
        let text = track
            .as_str()
            .ok_or_else(|| Error::Parse(format!("{} is not text", track.track)))?;

        match track.track {
            TrackNumber::One => Self::from_track1(text),
            TrackNumber::Two => Self::from_track2(text),
            TrackNumber::Three => Err(Error::Parse("track 3 carries no ISO 7813 fields".into())),
        }
    }

    /// Parse from a read, preferring track 1 for the cardholder name
    pub fn from_tracks(tracks: &TrackSet) -> Result<Self> {
        let mut last_error = Error::Parse("no track 1 or 2 data".into());

        for number in [TrackNumber::One, TrackNumber::Two] {
            if let Some(track) = tracks.get(number).filter(|t| t.is_present()) {
                match Self::from_track(track) {
                    Ok(details) => return Ok(details),
                    Err(e) => last_error = e,
                }
            }
        }

        Err(last_error)
    }

    /// Cardholder name as `GIVEN SURNAME`
    pub fn display_name(&self) -> Option<String> {
        let name = self.name.as_deref()?;
        match name.split_once('/') {
            Some((surname, given)) if !given.trim().is_empty() => {
                Some(format!("{} {}", given.trim(), surname.trim()))
            }
            _ => Some(name.replace('/', " ").trim().to_string()),
        }
    }

    /// PAN with all but the last four digits masked
    pub fn masked_pan(&self) -> String {
        let visible = self.pan.len().saturating_sub(4);
        format!("{}{}", "*".repeat(visible), &self.pan[visible..])
    }
}

impl fmt::Debug for CardDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardDetails")
            .field("pan", &self.masked_pan())
            .field("name", &self.name)
            .field("expiry", &self.expiry)
            .field("service_code", &self.service_code)
            .finish()
    }
}

fn strip_sentinels(text: &str, start: char) -> &str {
    let text = text.strip_prefix(start).unwrap_or(text);
    match text.find('?') {
        Some(end) => &text[..end],
        None => text,
    }
}

fn validate_pan(pan: &str) -> Result<String> {
    let pan = pan.trim();
    if pan.is_empty() || pan.len() > MAX_PAN_LEN || !pan.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Parse(format!("invalid PAN ({} chars)", pan.len())));
    }
    Ok(pan.to_string())
}

fn expiry_and_service(rest: &str) -> Result<(String, Option<String>)> {
    let digits = rest.as_bytes();
    if digits.len() < 4 || !digits[..4].iter().all(u8::is_ascii_digit) {
        return Err(Error::Parse("missing YYMM expiry".into()));
    }

    let expiry = format!("{}/{}", &rest[..2], &rest[2..4]);
    let service_code = rest
        .get(4..7)
        .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
        .map(str::to_string);

    Ok((expiry, service_code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TrackStatus;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_track1() {
        let card = CardDetails::from_track1("4111111111111111^DOE/JOHN^25121010000000000000").unwrap();

        assert_eq!(card.pan, "4111111111111111");
        assert_eq!(card.name.as_deref(), Some("DOE/JOHN"));
        assert_eq!(card.display_name().as_deref(), Some("JOHN DOE"));
        assert_eq!(card.expiry, "25/12");
        assert_eq!(card.service_code.as_deref(), Some("101"));
    }

    #[test]
    fn test_track1_with_sentinels() {
        let card = CardDetails::from_track1("%B5500000000000004^SMITH/ANNE     ^2703201?").unwrap();

        assert_eq!(card.pan, "5500000000000004");
        assert_eq!(card.name.as_deref(), Some("SMITH/ANNE"));
        assert_eq!(card.expiry, "27/03");
    }

    #[test]
    fn test_track2() {
        let card = CardDetails::from_track2(";4111111111111111=25121010000?").unwrap();

        assert_eq!(card.pan, "4111111111111111");
        assert_eq!(card.name, None);
        assert_eq!(card.expiry, "25/12");
        assert_eq!(card.masked_pan(), "************1111");
    }

    #[test]
    fn test_malformed() {
        assert!(CardDetails::from_track1("A4111^X^2512").is_err());
        assert!(CardDetails::from_track1("4111111111111111^DOE/JOHN").is_err());
        assert!(CardDetails::from_track2("4111111111111111D2512").is_err());
        assert!(CardDetails::from_track2("41X1=2512").is_err());
        assert!(CardDetails::from_track2("4111=25").is_err());
    }

    #[test]
    fn test_from_tracks_falls_back_to_track2() {
        let mut set = TrackSet::new();
        set.insert(TrackData::absent(TrackNumber::One, TrackStatus::ParityError));
        set.insert(TrackData::from_plaintext(TrackNumber::Two, TrackStatus::Ok, b"4111111111111111=2512101").unwrap());

        let card = CardDetails::from_tracks(&set).unwrap();
        assert_eq!(card.expiry, "25/12");
        assert_eq!(card.name, None);
    }

    #[test]
    fn test_debug_masks_pan() {
        let card = CardDetails::from_track2("4111111111111111=2512").unwrap();
        assert!(!format!("{:?}", card).contains("411111"));
    }
}
