use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::time;
use tracing::debug;

use crate::ConfigError;

/// Per-sample timeout for command probes
const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Configuration of one user declared probe, a `custom_collectors` list
/// entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: ProbeKind,
    pub transform: Option<TransformSpec>,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeKind {
    /// Whole-file read
    File { path: PathBuf },
    /// Shell command, trimmed stdout
    Command { command: String },
    /// Environment variable with an optional fallback
    Env {
        variable: String,
        default: Option<String>,
    },
}

/// Declared transform set. This is deliberately closed: there is no
/// expression evaluator, anything unrecognized fails deserialization and
/// with it config load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransformSpec {
    Named(NamedTransform),
    Scale { scale: f64 },
    Regex { regex: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NamedTransform {
    Identity,
    ParseInt,
    ParseFloat,
    Trim,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("I/O = {0}")]
    Io(#[from] std::io::Error),
    #[error("environment variable {0} not set")]
    MissingEnv(String),
    #[error("command failed, {0}")]
    Command(String),
    #[error("command timed out")]
    Timeout,
    #[error("not an integer = {0:?}")]
    NotAnInteger(String),
    #[error("not a number = {0:?}")]
    NotANumber(String),
    #[error("regex did not match")]
    NoMatch,
}

#[derive(Debug)]
enum Transform {
    Identity,
    ParseInt,
    ParseFloat,
    Scale(f64),
    Trim,
    RegexExtract(Regex),
}

impl Transform {
    fn compile(name: &str, spec: Option<&TransformSpec>) -> Result<Transform, ConfigError> {
        let transform = match spec {
            None => Transform::Identity,
            Some(TransformSpec::Named(NamedTransform::Identity)) => Transform::Identity,
            Some(TransformSpec::Named(NamedTransform::ParseInt)) => Transform::ParseInt,
            Some(TransformSpec::Named(NamedTransform::ParseFloat)) => Transform::ParseFloat,
            Some(TransformSpec::Named(NamedTransform::Trim)) => Transform::Trim,
            Some(TransformSpec::Scale { scale }) => Transform::Scale(*scale),
            Some(TransformSpec::Regex { regex }) => {
                let regex = Regex::new(regex).map_err(|source| ConfigError::InvalidTransform {
                    name: name.to_owned(),
                    source,
                })?;
                Transform::RegexExtract(regex)
            }
        };

        Ok(transform)
    }

    fn apply(&self, raw: &str) -> Result<Value, ProbeError> {
        match self {
            Transform::Identity => Ok(auto_numeric(raw)),
            Transform::ParseInt => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| ProbeError::NotAnInteger(raw.to_owned())),
            Transform::ParseFloat => raw
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| ProbeError::NotANumber(raw.to_owned())),
            Transform::Scale(factor) => {
                let number = raw
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| ProbeError::NotANumber(raw.to_owned()))?;
                Ok(Value::from(number * factor))
            }
            Transform::Trim => Ok(Value::from(raw.trim())),
            Transform::RegexExtract(regex) => {
                let captures = regex.captures(raw).ok_or(ProbeError::NoMatch)?;
                let matched = captures
                    .get(1)
                    .or_else(|| captures.get(0))
                    .ok_or(ProbeError::NoMatch)?;
                Ok(auto_numeric(matched.as_str()))
            }
        }
    }
}

/// Untransformed probe output parses to an integer when it can, then a
/// float, otherwise stays text
fn auto_numeric(raw: &str) -> Value {
    let trimmed = raw.trim();
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::from(int);
    }

    if let Ok(float) = trimmed.parse::<f64>() {
        return Value::from(float);
    }

    Value::from(trimmed)
}

/// A runnable user declared probe
#[derive(Debug)]
pub struct Probe {
    pub name: String,
    kind: ProbeKind,
    transform: Transform,
    unit: String,
}

impl Probe {
    pub fn new(config: &CollectorConfig) -> Result<Probe, ConfigError> {
        Ok(Probe {
            name: config.name.clone(),
            kind: config.kind.clone(),
            transform: Transform::compile(&config.name, config.transform.as_ref())?,
            unit: config.unit.clone().unwrap_or_default(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self.kind {
            ProbeKind::File { .. } => "file",
            ProbeKind::Command { .. } => "command",
            ProbeKind::Env { .. } => "env",
        }
    }

    /// The `custom.<name>` payload entry: the sampled value with unit
    /// and kind on success, the reason inline on failure
    pub async fn collect(&self) -> Value {
        match self.sample().await {
            Ok(value) => json!({
                "value": value,
                "unit": self.unit,
                "type": self.kind(),
            }),
            Err(e) => {
                debug!("probe {} failed, error = {e}", self.name);
                json!({ "error": e.to_string() })
            }
        }
    }

    async fn sample(&self) -> Result<Value, ProbeError> {
        let raw = match &self.kind {
            ProbeKind::File { path } => tokio::fs::read_to_string(path).await?,
            ProbeKind::Command { command } => run_command(command).await?,
            ProbeKind::Env { variable, default } => match std::env::var(variable) {
                Ok(value) => value,
                Err(_) => default
                    .clone()
                    .ok_or_else(|| ProbeError::MissingEnv(variable.clone()))?,
            },
        };

        self.transform.apply(raw.trim())
    }
}

async fn run_command(command: &str) -> Result<String, ProbeError> {
    let output = time::timeout(
        COMMAND_TIMEOUT,
        Command::new("sh").arg("-c").arg(command).output(),
    )
    .await
    .map_err(|_| ProbeError::Timeout)??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::Command(format!(
            "{}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
