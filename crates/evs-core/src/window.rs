use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};

/// Calendar range a window identifier covers, both ends inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CollectionWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{0}` is not a collection window (expected YYYY, YYYY-QN, YYYY-MM or YYYY-MM-DD)")]
pub struct WindowParseError(pub String);

impl CollectionWindow {
    pub fn parse(s: &str) -> Result<Self, WindowParseError> {
        let err = || WindowParseError(s.to_string());
        let parts: Vec<&str> = s.split('-').collect();

        let year = parts
            .first()
            .filter(|y| y.len() == 4)
            .and_then(|y| digits(y))
            .ok_or_else(err)? as i32;

        match parts.as_slice() {
            [_] => {
                let start = NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(err)?;
                let end = NaiveDate::from_ymd_opt(year, 12, 31).ok_or_else(err)?;
                Ok(Self { start, end })
            }
            [_, q] if q.len() == 2 && (q.starts_with('Q') || q.starts_with('q')) => {
                let n = digits(&q[1..]).filter(|n| (1..=4).contains(n)).ok_or_else(err)?;
                let first = (n - 1) * 3 + 1;
                let start = NaiveDate::from_ymd_opt(year, first, 1).ok_or_else(err)?;
                Ok(Self { start, end: month_end(year, first + 2).ok_or_else(err)? })
            }
            [_, m] if m.len() == 2 => {
                let month = digits(m).filter(|m| (1..=12).contains(m)).ok_or_else(err)?;
                let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(err)?;
                Ok(Self { start, end: month_end(year, month).ok_or_else(err)? })
            }
            [_, m, d] if m.len() == 2 && d.len() == 2 => {
                let day = NaiveDate::from_ymd_opt(year, digits(m).ok_or_else(err)?, digits(d).ok_or_else(err)?)
                    .ok_or_else(err)?;
                Ok(Self { start: day, end: day })
            }
            _ => Err(err()),
        }
    }

    /// True when `ts` falls on a day inside the window, or within `grace_days` after it.
    pub fn contains(&self, ts: DateTime<Utc>, grace_days: u32) -> bool {
        let day = ts.date_naive();
        let last = self
            .end
            .checked_add_days(Days::new(u64::from(grace_days)))
            .unwrap_or(NaiveDate::MAX);
        day >= self.start && day <= last
    }
}

fn digits(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn month_end(year: i32, month: u32) -> Option<NaiveDate> {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let last = next.pred_opt()?;
    debug_assert_eq!(last.month(), month);
    Some(last)
}
