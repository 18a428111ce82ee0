// Repair loop configuration shared by every entry point

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_TEST_LOOP: u32 = 3;
pub const DEFAULT_CASE_TIMEOUT_MS: u64 = 6_000;
pub const DEFAULT_COMPILE_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Maximum number of repair requests per invocation
    pub test_loop: u32,
    /// Hard upper bound on a single case execution
    pub per_case_timeout_ms: u64,
    /// Upper bound on the compile / syntax-check step
    pub compile_timeout_ms: u64,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            test_loop: DEFAULT_TEST_LOOP,
            per_case_timeout_ms: DEFAULT_CASE_TIMEOUT_MS,
            compile_timeout_ms: DEFAULT_COMPILE_TIMEOUT_MS,
        }
    }
}

impl RepairConfig {
    /// Defaults overridden by `REFORGE_TEST_LOOP`, `REFORGE_CASE_TIMEOUT_MS`
    /// and `REFORGE_COMPILE_TIMEOUT_MS`. Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            test_loop: parse_or(lookup("REFORGE_TEST_LOOP"), defaults.test_loop),
            per_case_timeout_ms: parse_or(
                lookup("REFORGE_CASE_TIMEOUT_MS"),
                defaults.per_case_timeout_ms,
            ),
            compile_timeout_ms: parse_or(
                lookup("REFORGE_COMPILE_TIMEOUT_MS"),
                defaults.compile_timeout_ms,
            ),
        }
    }

    pub fn per_case_timeout(&self) -> Duration {
        Duration::from_millis(self.per_case_timeout_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
