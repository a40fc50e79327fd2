use crate::constants::{LOCAL_SCAN_ACCEPT, LOCAL_SCAN_REJECT, LOCAL_SCAN_TEMPREJECT};
use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub enabled: bool,
    /// Directories searched for the scan module and its imports, in order.
    /// The working directory is only searched when listed, as the default
    /// `.` entry does.
    pub path_add: Vec<PathBuf>,
    pub host_module: String,
    pub scan_module: String,
    pub scan_function: String,
    pub failure_policy: FailurePolicy,
    pub standalone: StandaloneConfig,
    pub logging: Option<LoggingConfig>,
}

/// Decision substituted whenever the bridge itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Accept,
    Defer,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StandaloneConfig {
    /// Submission command for `child_open_exim`; `-f <sender>` and
    /// `-oMas <auth>` are appended.
    pub reinject_command: Vec<String>,
    /// Variables available to `$name` / `${name}` expansion.
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl FailurePolicy {
    pub fn decision_code(self) -> i32 {
        match self {
            FailurePolicy::Accept => LOCAL_SCAN_ACCEPT,
            FailurePolicy::Defer => LOCAL_SCAN_TEMPREJECT,
            FailurePolicy::Deny => LOCAL_SCAN_REJECT,
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "accept" => Ok(FailurePolicy::Accept),
            "defer" | "tempreject" => Ok(FailurePolicy::Defer),
            "deny" | "reject" => Ok(FailurePolicy::Deny),
            other => Err(anyhow::anyhow!(
                "Unknown failure policy '{other}', use accept, defer or deny"
            )),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailurePolicy::Accept => "accept",
            FailurePolicy::Defer => "defer",
            FailurePolicy::Deny => "deny",
        };
        f.write_str(name)
    }
}

impl Default for StandaloneConfig {
    fn default() -> Self {
        Self {
            reinject_command: vec![
                "/usr/sbin/exim".to_string(),
                "-odi".to_string(),
                "-oem".to_string(),
                "-oi".to_string(),
                "-t".to_string(),
            ],
            variables: BTreeMap::new(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path_add: vec![PathBuf::from(".")],
            host_module: "exim".to_string(),
            scan_module: "exim_local_scan".to_string(),
            scan_function: "local_scan".to_string(),
            failure_policy: FailurePolicy::Accept,
            standalone: StandaloneConfig::default(),
            logging: Some(LoggingConfig {
                level: "info".to_string(),
            }),
        }
    }
}

/// Whether `name` can be used as a script identifier.
pub fn is_identifier(name: &str) -> bool {
    static IDENTIFIER: OnceLock<Option<Regex>> = OnceLock::new();
    IDENTIFIER
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

impl BridgeConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: BridgeConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML config: {path}"))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {path}"))?;
        Ok(())
    }

    /// Problems that would make every scan fall back to the failure policy.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if !is_identifier(&self.host_module) {
            problems.push(format!(
                "host_module '{}' is not a valid identifier",
                self.host_module
            ));
        }
        if self.scan_module.is_empty() {
            problems.push("scan_module must not be empty".to_string());
        }
        if !is_identifier(&self.scan_function) {
            problems.push(format!(
                "scan_function '{}' is not a valid identifier",
                self.scan_function
            ));
        }
        if self.path_add.is_empty() {
            problems.push("path_add is empty, the scan module can't be found".to_string());
        }
        for path in &self.path_add {
            if !path.is_dir() {
                problems.push(format!("path_add entry {} is not a directory", path.display()));
            }
        }

        problems
    }

    /// Directories searched for the scan module, in order.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.path_add.clone()
    }
}
