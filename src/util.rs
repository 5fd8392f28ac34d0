use std::{future::Future, time::Duration};

use anyhow::{Context, Result, anyhow};
use time::OffsetDateTime;
use tokio::time::timeout;

/// Formats a byte count using decimal (SI) units, e.g. `64.0MB`.
pub fn byte_count_decimal(bytes: u64) -> String {
    const UNIT: u64 = 1000;
    if bytes < UNIT {
        return format!("{bytes}B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = ['k', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1}{}B", bytes as f64 / div as f64, suffix)
}

/// Renders a UTC timestamp with fixed millisecond precision,
/// e.g. `2026-08-07T12:34:56.123Z`.
pub fn fixed_utc_timestamp(ts: OffsetDateTime) -> String {
    let ts = ts.to_offset(time::UtcOffset::UTC);
    let (year, month, day) = ts.to_calendar_date();
    let (hour, minute, second) = ts.to_hms();
    let millisecond = ts.millisecond();
    let month_number: u8 = month.into();
    format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    )
}

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| anyhow!("timed out {context}"))?
        .with_context(|| format!("failed while {context}"))
}
