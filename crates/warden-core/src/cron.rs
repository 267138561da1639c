//! Five-field cron evaluation (minute, hour, day-of-month, month,
//! day-of-week) in a configured timezone.
//!
//! Field grammar: `*`, single values, `a-b` ranges, comma lists, and `/step`
//! on any of those. When both day fields are restricted a day matches if
//! *either* field matches (the widely deployed union convention).
//!
//! Candidate instants are enumerated in local wall-clock time. A local time
//! skipped by a spring-forward transition is shifted across the gap using
//! the pre-transition offset and fires once; a local time repeated by a
//! fall-back transition fires on its first occurrence only.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// A parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!(
                "expected 5 fields (minute hour day month weekday), got {}",
                fields.len()
            ));
        }

        let minutes = parse_field(fields[0], 0, 59)?;
        let hours = parse_field(fields[1], 0, 23)?;
        let dom = parse_field(fields[2], 1, 31)?;
        let months = parse_field(fields[3], 1, 12)?;
        let dow = parse_field(fields[4], 0, 7)?;
        // 7 is an alias for Sunday.
        let dow = if dow & (1 << 7) != 0 { (dow | 1) & 0x7f } else { dow };

        Ok(Self {
            minutes,
            hours,
            days_of_month: dom,
            months,
            days_of_week: dow,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    /// The next firing instant strictly after `after`, or `None` if no
    /// matching wall-clock time exists within the lookahead horizon
    /// (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let start = after.with_timezone(&tz).naive_local();
        let mut t = start
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(start)
            + ChronoDuration::minutes(1);
        let horizon = start + ChronoDuration::days(366 * 4 + 1);

        while t <= horizon {
            if self.months & (1 << t.month()) == 0 {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = (t.date() + ChronoDuration::days(1)).and_hms_opt(0, 0, 0)?;
                continue;
            }
            if self.hours & (1 << t.hour()) == 0 {
                t = t
                    .with_minute(0)
                    .map(|t| t + ChronoDuration::hours(1))?;
                continue;
            }
            if self.minutes & (1 << t.minute()) == 0 {
                t += ChronoDuration::minutes(1);
                continue;
            }

            match resolve_local(tz, t) {
                Some(utc) if utc > after => return Some(utc),
                _ => t += ChronoDuration::minutes(1),
            }
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom_ok = self.days_of_month & (1 << date.day()) != 0;
        let dow_ok = self.days_of_week & (1 << date.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

/// Maps a naive local candidate to a UTC instant under DST rules: repeated
/// local times take their first occurrence, skipped local times are shifted
/// across the gap with the pre-transition offset.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(first, _) => Some(first.with_timezone(&Utc)),
        LocalResult::None => {
            // Probe backwards for the last resolvable minute before the gap
            // and reuse its offset. DST gaps are at most a few hours.
            for back in 1..=180i64 {
                let probe = naive - ChronoDuration::minutes(back);
                let offset = match tz.from_local_datetime(&probe) {
                    LocalResult::Single(dt) => dt.offset().fix(),
                    LocalResult::Ambiguous(first, _) => first.offset().fix(),
                    LocalResult::None => continue,
                };
                let utc_naive = naive - ChronoDuration::seconds(offset.local_minus_utc() as i64);
                return Some(Utc.from_utc_datetime(&utc_naive));
            }
            None
        }
    }
}

/// Parses one cron field into a bitmask over `min..=max`.
fn parse_field(field: &str, min: u32, max: u32) -> Result<u64, String> {
    if field.is_empty() {
        return Err("empty field".to_string());
    }

    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}'"))?;
                if step == 0 {
                    return Err("step must be positive".to_string());
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let lo: u32 = lo.parse().map_err(|_| format!("invalid value '{lo}'"))?;
            let hi: u32 = hi.parse().map_err(|_| format!("invalid value '{hi}'"))?;
            if lo > hi {
                return Err(format!("inverted range {lo}-{hi}"));
            }
            (lo, hi)
        } else {
            let v: u32 = range
                .parse()
                .map_err(|_| format!("invalid value '{range}'"))?;
            // A bare value with a step (`a/n`) extends to the field maximum.
            if step > 1 { (v, max) } else { (v, v) }
        };

        if lo < min || hi > max {
            return Err(format!("value out of range {min}-{max}: {lo}-{hi}"));
        }
        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            v += step;
        }
    }
    Ok(mask)
}
