use mail_auth_engine::metrics::{ALL_EVENTS, INTERNAL_ERRORS};
use mail_auth_engine::MetricsSink;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;
use std::time::Duration;

/// Exposes engine events as prometheus counters.
/// Every event except `InternalErrors` is a `kind` of `auth_requests_total`.
pub struct PrometheusMetrics {
    auth_requests: IntCounterVec,
    internal_errors: IntCounter,
}

impl PrometheusMetrics {
    pub fn register(registry: &Registry) -> anyhow::Result<Self> {
        let auth_requests = IntCounterVec::new(
            Opts::new(
                "auth_requests_total",
                "number of authentication requests, by kind",
            ),
            &["kind"],
        )?;
        let internal_errors = IntCounter::new(
            "internal_errors_total",
            "number of requests that failed because of an internal error",
        )?;
        registry.register(Box::new(auth_requests.clone()))?;
        registry.register(Box::new(internal_errors.clone()))?;

        // Materialize every series so that they report zero before
        // the first increment
        for kind in ALL_EVENTS.iter().filter(|name| **name != INTERNAL_ERRORS) {
            auth_requests.with_label_values(&[*kind]);
        }

        Ok(Self {
            auth_requests,
            internal_errors,
        })
    }

    pub fn get(&self, name: &str) -> u64 {
        if name == INTERNAL_ERRORS {
            self.internal_errors.get()
        } else {
            self.auth_requests.with_label_values(&[name]).get()
        }
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        ALL_EVENTS.iter().map(|name| (*name, self.get(name))).collect()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn increment(&self, name: &str, delta: u64) {
        if name == INTERNAL_ERRORS {
            self.internal_errors.inc_by(delta);
        } else {
            self.auth_requests.with_label_values(&[name]).inc_by(delta);
        }
    }
}

/// Periodically writes the counters to the diagnostic log
pub fn spawn_metrics_logger(metrics: Arc<PrometheusMetrics>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for (name, value) in metrics.snapshot() {
                tracing::debug!(metric = name, value, "metrics");
            }
        }
    });
}
