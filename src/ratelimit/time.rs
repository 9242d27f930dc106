//! Time conversion helpers shared by the strategies.

use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Round a duration up to whole milliseconds.
///
/// Retry hints are rounded up so that waiting exactly the advertised time is
/// always long enough.
pub(crate) fn ceil_millis(duration: Duration) -> u64 {
    let nanos = duration.as_nanos();
    let millis = nanos / 1_000_000 + u128::from(nanos % 1_000_000 != 0);
    u64::try_from(millis).unwrap_or(u64::MAX)
}

/// Convert a positive, finite number of seconds into a [`Duration`].
pub(crate) fn positive_secs(name: &str, secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(TurnstileError::InvalidArgument(format!(
            "{name} must be a positive number of seconds, got {secs}"
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| TurnstileError::InvalidArgument(format!("{name}: {e}")))
}
