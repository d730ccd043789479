use crate::mode::Mode;

/// The lookup statements configured for each mode.
///
/// Each list is tried in order and the first statement that produces a
/// row decides the outcome, which allows layering backing stores: a fast
/// table first, then a fallback. A `QuerySet` is never mutated once built;
/// configuration reload builds a new one and swaps it in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuerySet {
    pub auth_lookup_queries: Vec<String>,
    pub relay_lookup_queries: Vec<String>,
}

impl QuerySet {
    pub fn new(auth_lookup_queries: Vec<String>, relay_lookup_queries: Vec<String>) -> Self {
        Self {
            auth_lookup_queries,
            relay_lookup_queries,
        }
    }

    pub fn resolve(&self, mode: Mode) -> &[String] {
        match mode {
            Mode::Login => &self.auth_lookup_queries,
            Mode::Relay => &self.relay_lookup_queries,
            Mode::Indeterminate => &[],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.auth_lookup_queries.is_empty() && self.relay_lookup_queries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolve_by_mode() {
        let set = QuerySet::new(
            vec!["login-1".to_string(), "login-2".to_string()],
            vec!["relay-1".to_string()],
        );
        k9::assert_equal!(set.resolve(Mode::Login).to_vec(), vec!["login-1", "login-2"]);
        k9::assert_equal!(set.resolve(Mode::Relay).to_vec(), vec!["relay-1"]);
        assert!(set.resolve(Mode::Indeterminate).is_empty());
        assert!(!set.is_empty());
        assert!(QuerySet::default().is_empty());
    }
}
