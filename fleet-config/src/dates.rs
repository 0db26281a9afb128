//! Flexible date parsing for configuration fields.

use chrono::{DateTime, Months, NaiveDate, TimeZone, Utc};

use crate::ConfigError;

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%d/%m/%Y",
];

/// Parse a configuration date.
///
/// Accepts `YYYY-MM-DD`, `YYYY/MM/DD`, `YYYY.MM.DD`, `DD-MM-YYYY`,
/// `DD.MM.YYYY`, `DD/MM/YYYY`, the literal `now`, and signed negative
/// integers meaning "N months ago".
pub fn parse_date(text: &str) -> Result<DateTime<Utc>, ConfigError> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("now") {
        return Ok(Utc::now());
    }

    if let Ok(months_ago) = text.parse::<i32>() {
        if months_ago < 0 {
            let shifted = Utc::now()
                .checked_sub_months(Months::new(months_ago.unsigned_abs()))
                .ok_or_else(|| ConfigError::Invalid(format!("incorrect date format: {text}")))?;
            return Ok(shifted);
        }
        return Err(ConfigError::Invalid(format!("incorrect date format: {text}")));
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            let midnight = date.and_hms_opt(0, 0, 0).expect("midnight always exists");
            return Ok(Utc.from_utc_datetime(&midnight));
        }
    }

    Err(ConfigError::Invalid(format!("incorrect date format: {text}")))
}
