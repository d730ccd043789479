//! Event counting.
//!
//! The engine doesn't own any counters; it reports named events to a
//! sink supplied by whoever embeds it. Many resolutions run at once,
//! so implementations must be safe to call concurrently.

pub const AUTH_REQUESTS: &str = "AuthRequests";
pub const AUTH_REQUESTS_LOGIN: &str = "AuthRequestsLogin";
pub const AUTH_REQUESTS_RELAY: &str = "AuthRequestsRelay";
pub const AUTH_REQUESTS_INDETERMINATE: &str = "AuthRequestsIndeterminate";
pub const AUTH_REQUESTS_SUCCESS: &str = "AuthRequestsSuccess";
pub const AUTH_REQUESTS_SUCCESS_LOGIN: &str = "AuthRequestsSuccessLogin";
pub const AUTH_REQUESTS_SUCCESS_RELAY: &str = "AuthRequestsSuccessRelay";
pub const AUTH_REQUESTS_FAILED: &str = "AuthRequestsFailed";
pub const AUTH_REQUESTS_FAILED_LOGIN: &str = "AuthRequestsFailedLogin";
pub const AUTH_REQUESTS_FAILED_RELAY: &str = "AuthRequestsFailedRelay";
pub const INTERNAL_ERRORS: &str = "InternalErrors";

/// Every event name that may be passed to [MetricsSink::increment]
pub const ALL_EVENTS: &[&str] = &[
    AUTH_REQUESTS,
    AUTH_REQUESTS_LOGIN,
    AUTH_REQUESTS_RELAY,
    AUTH_REQUESTS_INDETERMINATE,
    AUTH_REQUESTS_SUCCESS,
    AUTH_REQUESTS_SUCCESS_LOGIN,
    AUTH_REQUESTS_SUCCESS_RELAY,
    AUTH_REQUESTS_FAILED,
    AUTH_REQUESTS_FAILED_LOGIN,
    AUTH_REQUESTS_FAILED_RELAY,
    INTERNAL_ERRORS,
];

pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, delta: u64);
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Records increments so that tests can check exactly what was counted
    #[derive(Default)]
    pub struct CountingSink {
        counts: Mutex<BTreeMap<String, u64>>,
    }

    impl CountingSink {
        pub fn get(&self, name: &str) -> u64 {
            self.counts.lock().get(name).copied().unwrap_or(0)
        }

        pub fn snapshot(&self) -> BTreeMap<String, u64> {
            self.counts.lock().clone()
        }
    }

    impl MetricsSink for CountingSink {
        fn increment(&self, name: &str, delta: u64) {
            *self.counts.lock().entry(name.to_string()).or_default() += delta;
        }
    }

    #[test]
    fn counting_sink_accumulates() {
        let sink = CountingSink::default();
        sink.increment(INTERNAL_ERRORS, 1);
        sink.increment(INTERNAL_ERRORS, 2);
        k9::assert_equal!(sink.get(INTERNAL_ERRORS), 3);
        k9::assert_equal!(sink.get(AUTH_REQUESTS), 0);
    }
}
