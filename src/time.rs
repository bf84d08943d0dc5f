use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{HubError, Result};

/// Farcaster epoch (2021-01-01T00:00:00Z) expressed in unix milliseconds.
pub const FARCASTER_EPOCH_MS: u64 = 1_609_459_200_000;

pub fn current_millis() -> Result<u64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| HubError::InvalidParam(format!("system clock before unix epoch: {err}")))?;
    Ok(elapsed.as_millis() as u64)
}

/// Milliseconds since the Farcaster epoch for a given unix-millisecond clock.
pub fn millis_since_epoch(now_ms: u64) -> Result<u64> {
    now_ms.checked_sub(FARCASTER_EPOCH_MS).ok_or_else(|| {
        HubError::InvalidParam(format!("timestamp {now_ms}ms predates the Farcaster epoch"))
    })
}

/// Current Farcaster time in whole seconds.
pub fn farcaster_time() -> Result<u32> {
    let seconds = millis_since_epoch(current_millis()?)? / 1_000;
    u32::try_from(seconds)
        .map_err(|_| HubError::InvalidParam("farcaster time exceeds 32 bits".to_string()))
}
