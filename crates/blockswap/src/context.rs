//! Deadlines for cancellable requests.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// A child of `parent` that also cancels itself after `timeout`.
///
/// Must be called within a tokio runtime.
pub fn with_timeout(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let token = parent.child_token();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => timer.cancel(),
            _ = timer.cancelled() => {}
        }
    });
    token
}
