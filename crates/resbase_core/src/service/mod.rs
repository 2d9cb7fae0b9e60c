//! Core use-case services.
//!
//! # Responsibility
//! - Wrap repository and schema-evolution calls in a transaction.
//! - Emit one structured logging event per use-case call.
//!
//! # Invariants
//! - A service call either commits all of its writes or none of them when
//!   it owns the transaction; inside a caller's transaction it never
//!   commits or rolls back.

pub mod resource_service;
pub mod schema_service;

pub use resource_service::ResourceService;
pub use schema_service::SchemaService;

use crate::repo::RepoResult;
use log::{error, info, warn};
use std::time::Instant;

/// Runs `body` and logs `event` with status, duration and error code.
pub(crate) fn logged<T>(
    event: &'static str,
    subject: &str,
    body: impl FnOnce() -> RepoResult<T>,
) -> RepoResult<T> {
    let started_at = Instant::now();
    let result = body();
    match &result {
        Ok(_) => info!(
            "event={} module=service status=ok {} duration_ms={}",
            event,
            subject,
            started_at.elapsed().as_millis()
        ),
        Err(err) if err.is_fatal() => error!(
            "event={} module=service status=error {} duration_ms={} error_code={} error={}",
            event,
            subject,
            started_at.elapsed().as_millis(),
            err.code(),
            err
        ),
        Err(err) => warn!(
            "event={} module=service status=rejected {} duration_ms={} error_code={} error={}",
            event,
            subject,
            started_at.elapsed().as_millis(),
            err.code(),
            err
        ),
    }
    result
}
