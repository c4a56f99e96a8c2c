//! Retry of cluster reads during admission

use crate::error::{Error, Result};
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Status reasons that retrying cannot fix
const PERMANENT_REASONS: [&str; 12] = [
    "NotFound",
    "Unauthorized",
    "Forbidden",
    "AlreadyExists",
    "Gone",
    "Invalid",
    "BadRequest",
    "MethodNotAllowed",
    "NotAcceptable",
    "RequestEntityTooLarge",
    "UnsupportedMediaType",
    "Expired",
];

/// Whether `err` may succeed on a later attempt
pub fn is_retriable(err: &Error) -> bool {
    match err {
        Error::Kube(kube::Error::Api(resp)) => !PERMANENT_REASONS.contains(&resp.reason.as_str()),
        Error::ResourceNotFound { .. } | Error::InvalidArgument(_) => false,
        _ => true,
    }
}

/// Five short steps, as client tooling retries optimistic reads by default
pub fn default_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(10),
        randomization_factor: 0.1,
        multiplier: 1.0,
        max_interval: Duration::from_millis(10),
        max_elapsed_time: Some(Duration::from_millis(50)),
        ..Default::default()
    }
}

/// Run `op` until it succeeds, fails permanently or the backoff runs out
pub async fn retry_on_error<T, F, Fut>(op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with(default_backoff(), op).await
}

pub async fn retry_with<T, F, Fut>(backoff: ExponentialBackoff, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    backoff::future::retry(backoff, || {
        let attempt = op();
        async move {
            attempt.await.map_err(|e| {
                if is_retriable(&e) {
                    debug!("Retrying after transient error: {}", e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}
