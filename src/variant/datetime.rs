//! CIM datetime text codec
//!
//! Wire format is `yyyymmddHHMMSS.mmmmmmsUUU`, where `sUUU` is the signed
//! offset from UTC in minutes. Intervals replace the offset with `:000`.

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};

use super::{FromVariant, ToVariant, Variant};
use crate::{Error, Result};

/// 1601-01-01T00:00:00Z, the protocol's null timestamp
pub const WINDOWS_EPOCH_UNIX_SECONDS: i64 = -11_644_473_600;

const ZERO_STAMP: &str = "00000000000000";

/// Widest zone offset the three-digit minute field can carry
pub const MAX_OFFSET_MINUTES: i32 = 999;

/// A timestamp that may be unset. The zone offset is always whole minutes
/// within [`MAX_OFFSET_MINUTES`], so every value encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Option<DateTime<FixedOffset>>", into = "Option<DateTime<FixedOffset>>")]
pub struct CimDateTime(Option<DateTime<FixedOffset>>);

impl CimDateTime {
    pub const UNSET: CimDateTime = CimDateTime(None);

    /// Fails for zone offsets the wire format cannot represent
    pub fn new<Tz: TimeZone>(value: DateTime<Tz>) -> Result<Self> {
        let value = value.fixed_offset();
        let offset_seconds = value.offset().local_minus_utc();
        if offset_seconds % 60 != 0 || (offset_seconds / 60).abs() > MAX_OFFSET_MINUTES {
            return Err(Error::datetime(
                &value.to_rfc3339(),
                format!("zone offset of {}s does not fit the wire format", offset_seconds),
            ));
        }
        Ok(CimDateTime(Some(value)))
    }

    pub fn is_unset(&self) -> bool {
        self.0.is_none()
    }

    pub fn get(&self) -> Option<DateTime<FixedOffset>> {
        self.0
    }

    /// Render as CIM text; `None` for unset values and anything at or before the epoch
    pub fn encode(&self) -> Option<String> {
        let value = self.0?;
        let secs = value.timestamp();
        let at_or_before_epoch = secs < WINDOWS_EPOCH_UNIX_SECONDS
            || (secs == WINDOWS_EPOCH_UNIX_SECONDS && value.timestamp_subsec_nanos() == 0);
        if at_or_before_epoch {
            return None;
        }

        let offset_minutes = value.offset().local_minus_utc() / 60;
        Some(format!("{}{:+04}", value.format("%Y%m%d%H%M%S%.6f"), offset_minutes))
    }

    pub fn parse(text: &str) -> Result<Self> {
        if text.len() < 5 || !text.is_ascii() {
            return Err(Error::datetime(text, "invalid datetime string"));
        }

        if text.starts_with(ZERO_STAMP) {
            return Ok(CimDateTime::UNSET);
        }

        let zone_start = text.len() - 4;
        let offset_minutes: i32 = if text.as_bytes()[zone_start] == b':' {
            0
        } else {
            text[zone_start..]
                .parse()
                .map_err(|_| Error::datetime(text, "zone did not parse"))?
        };

        let stamp = &text[..zone_start];
        let number = |start: usize, end: usize| -> Result<u32> {
            stamp
                .get(start..end)
                .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::datetime(text, "date/time fields did not parse"))
        };

        let year = number(0, 4)? as i32;
        let (month, day) = (number(4, 6)?, number(6, 8)?);
        let (hour, minute, second) = (number(8, 10)?, number(10, 12)?, number(12, 14)?);
        let micros = parse_micros(&stamp[14..]).ok_or_else(|| Error::datetime(text, "fraction did not parse"))?;

        let naive = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|date| date.and_hms_micro_opt(hour, minute, second, micros))
            .ok_or_else(|| Error::datetime(text, "date/time out of range"))?;
        let offset = FixedOffset::east_opt(offset_minutes * 60)
            .ok_or_else(|| Error::datetime(text, "zone out of range"))?;
        let value = offset
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| Error::datetime(text, "ambiguous local time"))?;

        Ok(CimDateTime(Some(value)))
    }
}

fn parse_micros(fraction: &str) -> Option<u32> {
    if fraction.is_empty() {
        return Some(0);
    }
    let digits = fraction.strip_prefix('.')?;
    if digits.is_empty() || digits.len() > 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u32 = digits.parse().ok()?;
    Some(value * 10u32.pow(6 - digits.len() as u32))
}

impl<Tz: TimeZone> TryFrom<DateTime<Tz>> for CimDateTime {
    type Error = Error;

    fn try_from(value: DateTime<Tz>) -> Result<Self> {
        CimDateTime::new(value)
    }
}

impl TryFrom<Option<DateTime<FixedOffset>>> for CimDateTime {
    type Error = Error;

    fn try_from(value: Option<DateTime<FixedOffset>>) -> Result<Self> {
        value.map_or(Ok(CimDateTime::UNSET), CimDateTime::new)
    }
}

impl From<CimDateTime> for Option<DateTime<FixedOffset>> {
    fn from(value: CimDateTime) -> Self {
        value.0
    }
}

impl ToVariant for CimDateTime {
    fn to_variant(&self) -> Variant {
        match self.encode() {
            Some(text) => Variant::String(text),
            None => Variant::Null,
        }
    }
}

impl FromVariant for CimDateTime {
    fn from_variant(value: &Variant) -> Result<Self> {
        match value {
            Variant::Null => Ok(CimDateTime::UNSET),
            Variant::String(text) => CimDateTime::parse(text),
            other => Err(Error::conversion(other.type_name(), "CIM datetime")),
        }
    }
}
