//! Custom serde helpers for configuration fields.

/// Parses delay fields given either as Go-style duration strings
/// (`"250ms"`, `"10s"`, `"1m30s"`, `"2h"`) or as bare integer seconds.
pub mod duration {
    use std::time::Duration;

    use serde::de::{Deserializer, Error};
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(D::Error::custom),
        }
    }

    pub(crate) fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty duration".into());
        }
        if let Ok(secs) = text.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        let mut total = Duration::ZERO;
        let mut digits = String::new();
        let mut chars = text.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                continue;
            }
            if digits.is_empty() {
                return Err(format!("incorrect duration format: {text}"));
            }
            let value: u64 = digits.parse().map_err(|_| format!("incorrect duration format: {text}"))?;
            digits.clear();

            let unit = match ch {
                'm' if chars.peek() == Some(&'s') => {
                    chars.next();
                    Duration::from_millis(value)
                }
                'm' => Duration::from_secs(value * 60),
                's' => Duration::from_secs(value),
                'h' => Duration::from_secs(value * 3600),
                other => return Err(format!("unknown duration unit '{other}' in {text}")),
            };
            total += unit;
        }
        if !digits.is_empty() {
            return Err(format!("duration is missing a unit: {text}"));
        }
        Ok(total)
    }
}
