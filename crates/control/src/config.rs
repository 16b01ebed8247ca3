//! Runtime switches for `ReplicaControl`, read once at construction.

#![forbid(unsafe_code)]

/// Reporter name used when `ORDSET_EVENT_REPORTER` is unset.
pub const DEFAULT_REPORTER: &str = "ordset-controller";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlConfig {
    /// Maintain claim owner references per the retention policy. Off leaves claims untouched.
    pub auto_delete_claims: bool,
    /// Component name stamped on published events.
    pub reporter: String,
}

impl Default for ControlConfig {
    fn default() -> Self { Self { auto_delete_claims: true, reporter: DEFAULT_REPORTER.to_string() } }
}

fn flag(v: &str) -> bool { v == "1" || v.eq_ignore_ascii_case("true") }

impl ControlConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            auto_delete_claims: std::env::var("ORDSET_AUTO_DELETE_PVC").ok().map(|v| flag(&v)).unwrap_or(d.auto_delete_claims),
            reporter: std::env::var("ORDSET_EVENT_REPORTER").ok().filter(|s| !s.is_empty()).unwrap_or(d.reporter),
        }
    }

    pub fn with_auto_delete_claims(mut self, on: bool) -> Self {
        self.auto_delete_claims = on;
        self
    }
}
