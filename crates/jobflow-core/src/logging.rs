//! Tracing setup and lifecycle spans
//!
//! Library code only emits `tracing` events. Binaries and tests call
//! [`init_tracing`] once to install a subscriber.

use crate::job::Job;
use once_cell::sync::OnceCell;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: OnceCell<()> = OnceCell::new();

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable
    #[default]
    Pretty,
}

/// Install a fmt subscriber filtered by `RUST_LOG`, else `default_filter`
///
/// Safe to call repeatedly; only the first call has an effect, and an
/// already installed global subscriber is left alone.
pub fn init_tracing(default_filter: &str) {
    init_tracing_with(default_filter, LogFormat::Pretty);
}

/// [`init_tracing`] with an explicit output format
pub fn init_tracing_with(default_filter: &str, format: LogFormat) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));

        let installed = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(false))
                .try_init(),
        };

        if installed.is_err() {
            tracing::debug!("global tracing subscriber already installed");
        }
    });
}

/// Span covering one job's execution
#[must_use]
pub fn job_span(job: &Job) -> Span {
    tracing::info_span!(
        "job",
        job_id = %job.id(),
        submit_id = %job.submit_id(),
        task_id = %job.task().id(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_tracing("warn");
        init_tracing_with("debug", LogFormat::Json);
        tracing::info!("still alive");
    }
}
