//! Human-readable duration format used on the wire: concatenated
//! integer-and-unit segments such as `1h30m`, `45s`, `2d`. Bare integers
//! are seconds.

use std::time::Duration;

const UNITS: [(char, u64); 4] = [('s', 1), ('m', 60), ('h', 3600), ('d', 86400)];

/// Parses a duration string. Accepts `90`, `45s`, `5m`, `1h30m`, `2d4h30m15s`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    // Bare integer means seconds.
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut value: Option<u64> = None;
    for c in s.chars() {
        if let Some(d) = c.to_digit(10) {
            value = Some(
                value
                    .unwrap_or(0)
                    .checked_mul(10)
                    .and_then(|v| v.checked_add(d as u64))
                    .ok_or_else(|| format!("duration overflow: {input}"))?,
            );
        } else {
            let unit = UNITS
                .iter()
                .find(|(u, _)| *u == c.to_ascii_lowercase())
                .map(|(_, mult)| *mult)
                .ok_or_else(|| format!("invalid duration unit '{c}' in '{input}'"))?;
            let v = value
                .take()
                .ok_or_else(|| format!("unit '{c}' without a value in '{input}'"))?;
            total = total
                .checked_add(v.checked_mul(unit).ok_or("duration overflow")?)
                .ok_or_else(|| format!("duration overflow: {input}"))?;
        }
    }
    if value.is_some() {
        return Err(format!("trailing digits without a unit in '{input}'"));
    }

    Ok(Duration::from_secs(total))
}

/// Formats a duration in the same segment notation, e.g. `1h30m`, `45s`.
pub fn format_duration(d: Duration) -> String {
    let mut secs = d.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    for (unit, mult) in UNITS.iter().rev() {
        if secs >= *mult {
            out.push_str(&format!("{}{}", secs / mult, unit));
            secs %= mult;
        }
    }
    out
}

pub mod serde_duration {
    //! Serde codec storing durations in the wire notation.

    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(de)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
