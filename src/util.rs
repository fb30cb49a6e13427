//! Utility functions used by trackload, and available when building simulations.

use lazy_static::lazy_static;
use regex::Regex;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::TrackloadError;

lazy_static! {
    static ref TIMESPAN: Regex = Regex::new(
        r"^((?P<hours>\d+)h)?((?P<minutes>\d+)m)?((?P<seconds>\d+)s)?((?P<millis>\d+)ms)?$"
    )
    .expect("invalid timespan regex");
}

/// Parse a string representing a time span and return it as a [`Duration`].
///
/// Can be specified as an integer, indicating seconds. Or can use integers
/// together with one or more of "h", "m", "s" and "ms", in that order, indicating
/// "hours", "minutes", "seconds" and "milliseconds".
///
/// Valid formats include: 20, 20s, 3m, 2h, 1h20m, 3h30m10s, 150ms, 1s500ms, etc.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use trackload::util;
///
/// // 1 hour 2 minutes and 3 seconds is 3,723 seconds.
/// assert_eq!(util::parse_timespan("1h2m3s"), Some(Duration::from_secs(3_723)));
///
/// // 45 seconds is 45 seconds.
/// assert_eq!(util::parse_timespan("45"), Some(Duration::from_secs(45)));
///
/// // Milliseconds are supported for aggressive pacing.
/// assert_eq!(util::parse_timespan("150ms"), Some(Duration::from_millis(150)));
///
/// // Invalid value is rejected.
/// assert_eq!(util::parse_timespan("foo"), None);
/// ```
pub fn parse_timespan(time_str: &str) -> Option<Duration> {
    let time_str = time_str.trim();
    if time_str.is_empty() {
        return None;
    }

    // If an integer is passed in, assume it's seconds
    if let Ok(seconds) = u64::from_str(time_str) {
        trace!("{} is integer: {} seconds", time_str, seconds);
        return Some(Duration::from_secs(seconds));
    }

    let captures = TIMESPAN.captures(time_str)?;
    // Absent fields are zero, fields too large for a u64 are invalid.
    let field = |name: &str| -> Option<u64> {
        match captures.name(name) {
            Some(value) => u64::from_str(value.as_str()).ok(),
            None => Some(0),
        }
    };
    let (hours, minutes, seconds, millis) = (
        field("hours")?,
        field("minutes")?,
        field("seconds")?,
        field("millis")?,
    );
    trace!(
        "{} hours {} minutes {} seconds {} milliseconds",
        hours,
        minutes,
        seconds,
        millis
    );
    let total_millis = hours
        .checked_mul(60)?
        .checked_add(minutes)?
        .checked_mul(60)?
        .checked_add(seconds)?
        .checked_mul(1_000)?
        .checked_add(millis)?;
    Some(Duration::from_millis(total_millis))
}

/// Parse an inclusive `"{min}-{max}"` range of integers, for example a session length.
///
/// A single integer is a range of exactly that value.
///
/// # Example
/// ```rust
/// use trackload::util;
///
/// assert_eq!(util::parse_count_range("4-6"), Some((4, 6)));
/// assert_eq!(util::parse_count_range(" 3 - 6 "), Some((3, 6)));
/// assert_eq!(util::parse_count_range("5"), Some((5, 5)));
/// assert_eq!(util::parse_count_range("six"), None);
/// ```
pub fn parse_count_range(range: &str) -> Option<(usize, usize)> {
    let (min, max) = split_range(range);
    Some((usize::from_str(min).ok()?, usize::from_str(max).ok()?))
}

/// Parse an inclusive `"{min}-{max}"` range of time spans, for example a think time.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use trackload::util;
///
/// assert_eq!(
///     util::parse_timespan_range("5s-15s"),
///     Some((Duration::from_secs(5), Duration::from_secs(15)))
/// );
/// assert_eq!(
///     util::parse_timespan_range("50ms-150ms"),
///     Some((Duration::from_millis(50), Duration::from_millis(150)))
/// );
/// assert_eq!(util::parse_timespan_range("soon-later"), None);
/// ```
pub fn parse_timespan_range(range: &str) -> Option<(Duration, Duration)> {
    let (min, max) = split_range(range);
    Some((parse_timespan(min)?, parse_timespan(max)?))
}

// Split "min-max" on the first dash, a lone value is both ends of the range.
fn split_range(range: &str) -> (&str, &str) {
    match range.split_once('-') {
        Some((min, max)) => (min.trim(), max.trim()),
        None => (range.trim(), range.trim()),
    }
}

/// Sleep for a specified duration, minus the time spent doing other things.
///
/// Returns the instant the sleep ended, to be passed back in as the next drift
/// timer.
pub async fn sleep_minus_drift(
    duration: Duration,
    drift: tokio::time::Instant,
) -> tokio::time::Instant {
    match duration.checked_sub(drift.elapsed()) {
        Some(delay) if delay.as_nanos() > 0 => tokio::time::sleep(delay).await,
        _ => debug!("sleep_minus_drift: drift was greater than or equal to duration, not sleeping"),
    };
    tokio::time::Instant::now()
}

/// Helper function to determine if a tracker endpoint can be parsed.
///
/// # Example
/// ```rust
/// use trackload::util;
///
/// assert!(util::is_valid_host("http://matomo-tracker/matomo.php").is_ok());
/// assert!(util::is_valid_host("http://127.0.0.1:8080/matomo.php").is_ok());
/// assert!(util::is_valid_host("matomo-tracker/matomo.php").is_err());
/// ```
pub fn is_valid_host(host: &str) -> Result<bool, TrackloadError> {
    Url::parse(host).map_err(|parse_error| TrackloadError::InvalidHost {
        host: host.to_string(),
        detail: "Invalid tracker endpoint.".to_string(),
        parse_error,
    })?;
    Ok(true)
}

// Internal helper to configure the control-c handler. Shutdown cleanly on the first
// ctrl-c. Exit abruptly on the second ctrl-c.
pub(crate) fn setup_ctrlc_handler(canceled: &Arc<AtomicBool>) {
    let caught_ctrlc = canceled.clone();
    match ctrlc::set_handler(move || {
        // We've caught a ctrl-c, determine if it's the first time or an additional time.
        if caught_ctrlc.load(Ordering::SeqCst) {
            warn!("caught another ctrl-c, exiting immediately...");
            std::process::exit(1);
        } else {
            warn!("caught ctrl-c, stopping...");
            caught_ctrlc.store(true, Ordering::SeqCst);
        }
    }) {
        Ok(_) => (),
        // Only one handler can be registered per process, which happens when
        // multiple simulations run in the same test binary.
        Err(e) => info!("ctrl-c handler not registered: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespan() {
        assert_eq!(parse_timespan("0"), Some(Duration::from_secs(0)));
        assert_eq!(parse_timespan("foo"), None);
        assert_eq!(parse_timespan(""), None);
        assert_eq!(parse_timespan("1"), Some(Duration::from_secs(1)));
        assert_eq!(parse_timespan("1s"), Some(Duration::from_secs(1)));
        assert_eq!(parse_timespan("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_timespan("61"), Some(Duration::from_secs(61)));
        assert_eq!(parse_timespan("1m1s"), Some(Duration::from_secs(61)));
        assert_eq!(parse_timespan("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_timespan("1h"), Some(Duration::from_secs(3_600)));
        assert_eq!(parse_timespan("1h1m1s"), Some(Duration::from_secs(3_661)));
        assert_eq!(parse_timespan("1h30m"), Some(Duration::from_secs(5_400)));
        assert_eq!(parse_timespan("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_timespan("1s500ms"), Some(Duration::from_millis(1_500)));
        assert_eq!(parse_timespan("1m5ms"), Some(Duration::from_millis(60_005)));
        // Units must be in order.
        assert_eq!(parse_timespan("1s1m"), None);
        assert_eq!(parse_timespan("-5"), None);
        // Values that don't fit in milliseconds are rejected.
        assert_eq!(parse_timespan("9999999999999999h"), None);
        assert_eq!(parse_timespan("99999999999999999999s"), None);
        assert_eq!(parse_timespan("18446744073709551615ms"), Some(Duration::from_millis(u64::MAX)));
    }

    #[test]
    fn ranges() {
        assert_eq!(parse_count_range("4-6"), Some((4, 6)));
        assert_eq!(parse_count_range("3-6"), Some((3, 6)));
        assert_eq!(parse_count_range("7"), Some((7, 7)));
        // Inverted ranges parse, validation rejects them later.
        assert_eq!(parse_count_range("6-4"), Some((6, 4)));
        assert_eq!(parse_count_range("4-"), None);
        assert_eq!(parse_count_range("-4"), None);

        assert_eq!(
            parse_timespan_range("30s-60s"),
            Some((Duration::from_secs(30), Duration::from_secs(60)))
        );
        assert_eq!(
            parse_timespan_range("5-15"),
            Some((Duration::from_secs(5), Duration::from_secs(15)))
        );
        assert_eq!(
            parse_timespan_range("1s"),
            Some((Duration::from_secs(1), Duration::from_secs(1)))
        );
        assert_eq!(parse_timespan_range("1s-"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn drift() {
        let drift_timer = tokio::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(250)).await;
        let woke = sleep_minus_drift(Duration::from_secs(1), drift_timer).await;
        // Only the remaining 750 milliseconds were slept.
        assert_eq!(woke - drift_timer, Duration::from_secs(1));

        // Drift larger than the duration doesn't sleep at all.
        let drift_timer = tokio::time::Instant::now();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let before = tokio::time::Instant::now();
        let woke = sleep_minus_drift(Duration::from_secs(1), drift_timer).await;
        assert_eq!(woke, before);
    }

    #[test]
    fn valid_host() {
        assert!(is_valid_host("http://example.com").is_ok());
        assert!(is_valid_host("example.com").is_err());
        assert!(is_valid_host("http://example.com/matomo.php").is_ok());
        assert!(is_valid_host("https://stats.example.com/piwik.php").is_ok());
        assert!(is_valid_host("/matomo.php").is_err());
        assert!(is_valid_host("http://").is_err());
        assert!(is_valid_host("http:// example.com").is_err());
    }
}
