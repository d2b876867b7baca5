//! Cancellable waiting shared by the polling components.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::domain::{Phase, Result, ShiplineError};

/// Fail fast if `cancel` has fired.
pub fn ensure_active(cancel: &CancellationToken, phase: Phase) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ShiplineError::Cancelled { phase });
    }
    Ok(())
}

/// Sleep for `interval` unless cancelled first.
pub async fn sleep_or_cancel(
    interval: Duration,
    cancel: &CancellationToken,
    phase: Phase,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ShiplineError::Cancelled { phase }),
        _ = tokio::time::sleep(interval) => Ok(()),
    }
}
