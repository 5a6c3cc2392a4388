//! fleetpatch.toml configuration parser.
//!
//! Every section is optional. Durations are human strings (`"5s"`,
//! `"500ms"`, `"2m"`). Step overrides are layered field by field over the
//! built-in options of that step.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use fleetpatch_saga::{SagaSettings, StepKind, StepOptions};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetpatchConfig {
    pub daemon: DaemonConfig,
    pub approval: ApprovalConfig,
    pub steps: HashMap<String, StepConfig>,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    /// `text` or `json`.
    pub log_format: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    pub timeout: Option<String>,
    pub heartbeat_timeout: Option<String>,
    pub maximum_attempts: Option<u32>,
    pub initial_interval: Option<String>,
    pub backoff_coefficient: Option<f64>,
    pub maximum_interval: Option<String>,
    pub non_retryable_error_types: Option<Vec<String>>,
}

/// Behaviour of the simulated fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub hosts_per_cluster: u32,
    /// Base latency of every remote operation.
    pub latency: String,
    /// Hosts whose precondition check reports them ineligible.
    pub ineligible_hosts: Vec<String>,
    /// Clusters whose first host discovery attempt fails.
    pub flaky_clusters: Vec<String>,
    /// Hosts whose first health check attempt fails.
    pub flaky_hosts: Vec<String>,
    /// Hosts whose update always fails with a non-retryable error.
    pub broken_hosts: Vec<String>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            hosts_per_cluster: 4,
            latency: "200ms".to_string(),
            ineligible_hosts: Vec::new(),
            flaky_clusters: Vec::new(),
            flaky_hosts: Vec::new(),
            broken_hosts: Vec::new(),
        }
    }
}

impl FleetpatchConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: FleetpatchConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` if given, otherwise the built-in defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Resolve approval and step sections into engine settings.
    pub fn saga_settings(&self) -> anyhow::Result<SagaSettings> {
        let mut settings = SagaSettings::default();
        if let Some(timeout) = &self.approval.timeout {
            settings.approval_timeout = duration_field("approval.timeout", timeout)?;
        }

        for (name, step) in &self.steps {
            let Some(kind) = StepKind::from_name(name) else {
                bail!("unknown step in [steps.{name}]");
            };
            let options = step
                .apply(kind.default_options())
                .with_context(|| format!("in [steps.{name}]"))?;
            settings.policies.set(kind, options);
        }
        Ok(settings)
    }
}

impl StepConfig {
    fn apply(&self, mut options: StepOptions) -> anyhow::Result<StepOptions> {
        if let Some(v) = &self.timeout {
            options.timeout = duration_field("timeout", v)?;
        }
        if let Some(v) = &self.heartbeat_timeout {
            options.heartbeat_timeout = Some(duration_field("heartbeat_timeout", v)?);
        }
        if let Some(v) = self.maximum_attempts {
            options.retry.maximum_attempts = v;
        }
        if let Some(v) = &self.initial_interval {
            options.retry.initial_interval = duration_field("initial_interval", v)?;
        }
        if let Some(v) = self.backoff_coefficient {
            options.retry.backoff_coefficient = v;
        }
        if let Some(v) = &self.maximum_interval {
            options.retry.maximum_interval = Some(duration_field("maximum_interval", v)?);
        }
        if let Some(v) = &self.non_retryable_error_types {
            options.retry.non_retryable_error_types = v.clone();
        }
        if let Err(e) = options.retry.validate() {
            bail!(e);
        }
        Ok(options)
    }
}

fn duration_field(field: &str, value: &str) -> anyhow::Result<Duration> {
    parse_duration(value).with_context(|| format!("{field}: invalid duration {value:?}"))
}

/// Parse a duration string like "5s", "500ms", "2m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(&format!("{}m", u64::MAX)), None);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: FleetpatchConfig = toml::from_str("").unwrap();
        assert_eq!(config.simulation.hosts_per_cluster, 4);
        let settings = config.saga_settings().unwrap();
        assert_eq!(settings.approval_timeout, Duration::from_secs(300));
        assert_eq!(
            settings.policies.options(StepKind::PerformUpdate),
            StepKind::PerformUpdate.default_options()
        );
    }

    #[test]
    fn step_override_layers_over_defaults() {
        let toml_str = r#"
[approval]
timeout = "90s"

[steps.perform_update]
timeout = "30s"
maximum_attempts = 5
non_retryable_error_types = ["DiskFull"]
"#;
        let config: FleetpatchConfig = toml::from_str(toml_str).unwrap();
        let settings = config.saga_settings().unwrap();
        assert_eq!(settings.approval_timeout, Duration::from_secs(90));

        let update = settings.policies.options(StepKind::PerformUpdate);
        assert_eq!(update.timeout, Duration::from_secs(30));
        assert_eq!(update.heartbeat_timeout, Some(Duration::from_secs(2)));
        assert_eq!(update.retry.maximum_attempts, 5);
        assert_eq!(update.retry.non_retryable_error_types, vec!["DiskFull"]);
    }

    #[test]
    fn unknown_step_is_rejected() {
        let config: FleetpatchConfig = toml::from_str("[steps.reboot_everything]\n").unwrap();
        let err = config.saga_settings().unwrap_err();
        assert!(err.to_string().contains("reboot_everything"));
    }

    #[test]
    fn invalid_backoff_is_rejected() {
        let toml_str = r#"
[steps.stop_services]
backoff_coefficient = 0.5
"#;
        let config: FleetpatchConfig = toml::from_str(toml_str).unwrap();
        assert!(config.saga_settings().is_err());
    }

    #[test]
    fn bad_duration_names_the_field() {
        let toml_str = r#"
[approval]
timeout = "forever"
"#;
        let config: FleetpatchConfig = toml::from_str(toml_str).unwrap();
        let err = config.saga_settings().unwrap_err();
        assert!(err.to_string().contains("approval.timeout"));
    }
}
