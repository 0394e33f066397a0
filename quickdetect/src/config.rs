// THEORY:
// `OrchestratorConfig` holds the handful of knobs that shape every pipeline the
// orchestrator builds. It is deliberately flat: each field maps to one runtime
// resource (a buffer, a pacing cap, a semaphore, a broadcast channel).
//
// Configuration comes from three layers, later ones overriding earlier ones:
// compiled defaults, an optional JSON document, and `QD_*` environment
// variables. The result is always passed through `validate` before use.

use crate::core_modules::fetcher::MIN_FETCH_FPS;
use crate::core_modules::stream_buffer::OverflowPolicy;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const ENV_BUFFER_CAPACITY: &str = "QD_BUFFER_CAPACITY";
pub const ENV_OVERFLOW_POLICY: &str = "QD_OVERFLOW_POLICY";
pub const ENV_MAX_FETCH_FPS: &str = "QD_MAX_FETCH_FPS";
pub const ENV_MAX_CONCURRENT_RUNS: &str = "QD_MAX_CONCURRENT_RUNS";
pub const ENV_RETAIN_LIVE_RESULTS: &str = "QD_RETAIN_LIVE_RESULTS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Frames held between a live fetcher and its run.
    pub buffer_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Upper bound on the fetch rate of any live source, in frames per second.
    pub max_fetch_fps: f64,
    /// Runs allowed in `Running` at once; the rest wait in `Pending`.
    pub max_concurrent_runs: usize,
    /// Capacity of the broadcast channel behind `subscribe`.
    pub event_capacity: usize,
    /// Whether live runs keep their results for the terminal report. Static runs always do.
    pub retain_live_results: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 30,
            overflow_policy: OverflowPolicy::DropOldest,
            max_fetch_fps: 30.0,
            max_concurrent_runs: num_cpus::get().max(1),
            event_capacity: 256,
            retain_live_results: false,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overlaid with any `QD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides looked up by environment variable name, then validates.
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(value) = parsed(&lookup, ENV_BUFFER_CAPACITY)? {
            self.buffer_capacity = value;
        }
        if let Some(value) = parsed(&lookup, ENV_OVERFLOW_POLICY)? {
            self.overflow_policy = value;
        }
        if let Some(value) = parsed(&lookup, ENV_MAX_FETCH_FPS)? {
            self.max_fetch_fps = value;
        }
        if let Some(value) = parsed(&lookup, ENV_MAX_CONCURRENT_RUNS)? {
            self.max_concurrent_runs = value;
        }
        if let Some(raw) = lookup(ENV_RETAIN_LIVE_RESULTS) {
            self.retain_live_results = parse_flag(&raw).ok_or_else(|| ConfigError::Env {
                key: ENV_RETAIN_LIVE_RESULTS,
                value: raw.clone(),
                reason: "expected true/false, 1/0, yes/no or on/off".to_string(),
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid("buffer_capacity must be at least 1".to_string()));
        }
        if !(self.max_fetch_fps.is_finite() && self.max_fetch_fps >= MIN_FETCH_FPS) {
            return Err(ConfigError::Invalid(format!(
                "max_fetch_fps must be a finite number of at least {MIN_FETCH_FPS}, got {}",
                self.max_fetch_fps
            )));
        }
        if self.max_concurrent_runs == 0 {
            return Err(ConfigError::Invalid("max_concurrent_runs must be at least 1".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parsed<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&'static str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError::Env {
        key,
        value: raw.clone(),
        reason: e.to_string(),
    })
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let map: HashMap<&'static str, String> = pairs.iter().map(|(k, v)| (*k, v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.buffer_capacity, 30);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.max_fetch_fps, 30.0);
        assert!(config.max_concurrent_runs >= 1);
        assert!(!config.retain_live_results);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = OrchestratorConfig::default()
            .overlay(env(&[
                (ENV_BUFFER_CAPACITY, "8"),
                (ENV_OVERFLOW_POLICY, "drop-newest"),
                (ENV_MAX_FETCH_FPS, "12.5"),
                (ENV_MAX_CONCURRENT_RUNS, "2"),
                (ENV_RETAIN_LIVE_RESULTS, "yes"),
            ]))
            .expect("valid overrides");
        assert_eq!(config.buffer_capacity, 8);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.max_fetch_fps, 12.5);
        assert_eq!(config.max_concurrent_runs, 2);
        assert!(config.retain_live_results);
    }

    #[test]
    fn malformed_environment_values_name_the_variable() {
        let err = OrchestratorConfig::default()
            .overlay(env(&[(ENV_BUFFER_CAPACITY, "lots")]))
            .expect_err("not a number");
        assert!(matches!(err, ConfigError::Env { key: ENV_BUFFER_CAPACITY, .. }));

        let err = OrchestratorConfig::default()
            .overlay(env(&[(ENV_RETAIN_LIVE_RESULTS, "maybe")]))
            .expect_err("not a flag");
        assert!(matches!(err, ConfigError::Env { key: ENV_RETAIN_LIVE_RESULTS, .. }));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for pairs in [
            [(ENV_BUFFER_CAPACITY, "0")],
            [(ENV_MAX_FETCH_FPS, "0")],
            [(ENV_MAX_FETCH_FPS, "-3")],
            [(ENV_MAX_FETCH_FPS, "1e-20")],
            [(ENV_MAX_FETCH_FPS, "inf")],
            [(ENV_MAX_CONCURRENT_RUNS, "0")],
        ] {
            let err = OrchestratorConfig::default().overlay(env(&pairs)).expect_err("out of range");
            assert!(matches!(err, ConfigError::Invalid(_)), "{pairs:?} gave {err}");
        }
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = OrchestratorConfig::from_json(r#"{ "buffer_capacity": 4, "overflow_policy": "block" }"#)
            .expect("parse config");
        assert_eq!(config.buffer_capacity, 4);
        assert_eq!(config.overflow_policy, OverflowPolicy::Block);
        assert_eq!(config.event_capacity, 256);

        assert!(matches!(OrchestratorConfig::from_json("{ nope"), Err(ConfigError::Parse(_))));
    }
}
