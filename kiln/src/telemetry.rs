//! Tracing and telemetry instrumentation for kiln.
//!
//! Span helpers for job lifecycle phases and record helpers that emit
//! structured log events. With the `metrics` feature enabled the record
//! helpers also update the Prometheus metrics in [`crate::metrics`];
//! without it they are plain tracing calls.

use tracing::{info_span, Span};

/// Create a tracing span for job submission.
#[must_use]
pub fn submit_span(job_id: impl AsRef<str>, model: impl AsRef<str>) -> Span {
    info_span!(
        "kiln.submit",
        job_id = %job_id.as_ref(),
        model = %model.as_ref(),
    )
}

/// Create a tracing span for the provisioning phase.
#[must_use]
pub fn provision_span(job_id: impl AsRef<str>, mode: impl AsRef<str>) -> Span {
    info_span!(
        "kiln.provision",
        job_id = %job_id.as_ref(),
        mode = %mode.as_ref(),
    )
}

/// Create a tracing span for the deployment phase.
#[must_use]
pub fn deploy_span(job_id: impl AsRef<str>, backend_count: usize) -> Span {
    info_span!(
        "kiln.deploy",
        job_id = %job_id.as_ref(),
        backend_count = backend_count,
    )
}

/// Create a tracing span for the running phase.
#[must_use]
pub fn run_span(job_id: impl AsRef<str>) -> Span {
    info_span!("kiln.run", job_id = %job_id.as_ref())
}

/// Record a job submission.
pub fn record_job_submitted(model: impl AsRef<str>, mode: impl AsRef<str>) {
    tracing::info!(
        model = %model.as_ref(),
        mode = %mode.as_ref(),
        "job submitted"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_submitted(model.as_ref(), mode.as_ref());
}

/// Record a job reaching a terminal state.
pub fn record_job_finished(job_id: impl AsRef<str>, state: impl AsRef<str>) {
    tracing::info!(
        job_id = %job_id.as_ref(),
        state = %state.as_ref(),
        "job finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(state.as_ref());
}

/// Record a backend acquisition and the time it took.
pub fn record_backend_acquired(
    job_id: impl AsRef<str>,
    mode: impl AsRef<str>,
    duration_secs: f64,
) {
    tracing::info!(
        job_id = %job_id.as_ref(),
        mode = %mode.as_ref(),
        duration_secs = duration_secs,
        "backend acquired"
    );

    #[cfg(feature = "metrics")]
    {
        crate::metrics::observe_provision_duration(mode.as_ref(), duration_secs);
        crate::metrics::add_live_backends(1);
    }
}

/// Record a backend release.
pub fn record_backend_released(job_id: impl AsRef<str>, backend: impl AsRef<str>) {
    tracing::debug!(
        job_id = %job_id.as_ref(),
        backend = %backend.as_ref(),
        "backend released"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::add_live_backends(-1);
}

/// Record a backend whose release failed.
///
/// Deliberately loud: an orphaned backend keeps incurring cost until
/// someone tears it down out of band.
pub fn record_backend_orphaned(
    job_id: impl AsRef<str>,
    backend: impl AsRef<str>,
    error: impl AsRef<str>,
) {
    tracing::error!(
        job_id = %job_id.as_ref(),
        backend = %backend.as_ref(),
        error = %error.as_ref(),
        "backend release failed; instance may still be running and incurring cost"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_backend_orphaned();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_test_subscriber<T>(f: impl FnOnce() -> T) -> T {
        let subscriber = tracing_subscriber::fmt().with_test_writer().finish();
        tracing::subscriber::with_default(subscriber, f)
    }

    #[test]
    fn test_submit_span() {
        with_test_subscriber(|| {
            let span = submit_span("job-1", "sphere");
            assert_eq!(span.metadata().unwrap().name(), "kiln.submit");
        });
    }

    #[test]
    fn test_provision_span() {
        with_test_subscriber(|| {
            let span = provision_span("job-1", "local");
            assert_eq!(span.metadata().unwrap().name(), "kiln.provision");
        });
    }

    #[test]
    fn test_deploy_span() {
        with_test_subscriber(|| {
            let span = deploy_span("job-1", 4);
            assert_eq!(span.metadata().unwrap().name(), "kiln.deploy");
        });
    }

    #[test]
    fn test_run_span() {
        with_test_subscriber(|| {
            let span = run_span("job-1");
            assert_eq!(span.metadata().unwrap().name(), "kiln.run");
        });
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_job_submitted("sphere", "local");
        record_backend_acquired("job-1", "local", 0.25);
        record_backend_released("job-1", "backend-1");
        record_backend_orphaned("job-1", "backend-1", "api unreachable");
        record_job_finished("job-1", "completed");
    }
}
