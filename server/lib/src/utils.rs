use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arbored_proto::OperationError;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// LDAP generalized time at second resolution, always zulu.
const GENERALIZED_TIME_FMT: &[FormatItem<'static>] =
    format_description!("[year][month][day][hour][minute][second]Z");

pub fn duration_from_epoch_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Parse a generalized-time value (`YYYYMMDDhhmmssZ`) to a duration since the
/// unix epoch. Values before the epoch are rejected, the same as malformed
/// values - the operational attributes this is used for are all written by the
/// server itself and are never legitimately historic to that degree.
pub(crate) fn gtime_parse(attr: &str, raw: &str) -> Result<Duration, OperationError> {
    let pdt = PrimitiveDateTime::parse(raw, GENERALIZED_TIME_FMT).map_err(|e| {
        OperationError::InvalidAttributeValue {
            attr: attr.to_string(),
            cause: e.to_string(),
        }
    })?;
    let odt = pdt.assume_utc();
    let since_epoch = odt - OffsetDateTime::UNIX_EPOCH;
    since_epoch
        .try_into()
        .map_err(|_| OperationError::InvalidAttributeValue {
            attr: attr.to_string(),
            cause: format!("generalized time {raw} predates the epoch"),
        })
}

/// The largest value the format can carry. Clocks beyond year 9999 clamp to
/// this rather than writing a mangled attribute value.
const GENERALIZED_TIME_MAX: &str = "99991231235959Z";

/// Render a duration since the unix epoch as a generalized-time value.
pub(crate) fn gtime_format(ct: Duration) -> String {
    let rendered = time::Duration::try_from(ct)
        .ok()
        .and_then(|d| OffsetDateTime::UNIX_EPOCH.checked_add(d))
        .and_then(|odt| odt.format(&GENERALIZED_TIME_FMT).ok());
    match rendered {
        Some(raw) => raw,
        None => {
            admin_warn!(
                seconds = ct.as_secs(),
                "clock is not representable as generalized time, clamping"
            );
            GENERALIZED_TIME_MAX.to_string()
        }
    }
}
