//! Configuration model and loader.
//!
//! The configuration document is a single JSON file with four sections:
//! `common`, `app`, optional `cluster`, optional `dataset`. Loading
//! validates shape and semantics up front and resolves every path to an
//! absolute one; loader failures are fatal and happen before any side
//! effect. Unknown keys are warned about and ignored so configs written
//! for newer versions still load.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Fatal configuration errors. All map to exit code 2.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    Missing(PathBuf),
    #[error("cannot read config {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config is not valid JSON: {0}")]
    Malformed(String),
    #[error("{0}")]
    Semantic(String),
}

/// BIDS App analysis level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisLevel {
    Participant,
    Group,
}

impl AnalysisLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisLevel::Participant => "participant",
            AnalysisLevel::Group => "group",
        }
    }

    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "participant" => Ok(AnalysisLevel::Participant),
            "group" => Ok(AnalysisLevel::Group),
            other => Err(ConfigError::Semantic(format!(
                "unknown analysis_level '{other}' (expected 'participant' or 'group')"
            ))),
        }
    }
}

/// An extra bind mount from app config.
#[derive(Debug, Clone, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// Configured expected-output pattern for the completion oracle.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputCheck {
    /// Glob template; `{subject}` and `{session}` are substituted with
    /// bare ids before matching.
    pub pattern: String,
    /// Subdirectory of the output root the pattern is rooted at.
    #[serde(default)]
    pub directory: String,
}

/// The `common` section, validated and with absolute paths.
#[derive(Debug, Clone)]
pub struct CommonConfig {
    pub bids_folder: PathBuf,
    pub output_folder: PathBuf,
    pub tmp_folder: PathBuf,
    pub container: PathBuf,
    /// Container runtime command (`apptainer` unless overridden).
    pub container_engine: String,
    pub templateflow_dir: Option<PathBuf>,
    /// Host directory mounted as the container image cache. Without it,
    /// the cache env var points into per-unit scratch.
    pub apptainer_cachedir: Option<PathBuf>,
    pub optional_folder: Option<PathBuf>,
    /// Local-backend parallelism.
    pub jobs: usize,
    pub log_dir: PathBuf,
    pub reports_dir: PathBuf,
    /// Upstream tooling must not overwrite discovered app options when set.
    /// Honored, not enforced, by the engine.
    pub container_locked: bool,
    /// Seconds between SIGTERM and SIGKILL on cancellation.
    pub grace_period_secs: u64,
}

/// The `app` section.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub analysis_level: AnalysisLevel,
    /// Pass-through options appended after the unit selector, in order.
    pub options: Vec<String>,
    /// Extra arguments for the container runtime itself.
    pub apptainer_args: Vec<String>,
    pub mounts: Vec<Mount>,
    pub output_check: Option<OutputCheck>,
}

/// The optional `cluster` section.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub partition: String,
    /// Walltime, `H:MM:SS` or `HH:MM:SS`.
    pub time: String,
    /// Memory, `\d+[MG]`.
    pub mem: String,
    pub cpus: u32,
    pub job_name: String,
    pub modules: Vec<String>,
    pub environment: BTreeMap<String, String>,
    /// Scheduler stdout pattern; `%j` expands to the job id.
    pub output_pattern: String,
    pub error_pattern: String,
    pub monitor: bool,
    pub poll_interval_secs: u64,
    /// Advisory lock serializing dataset clone/push across jobs.
    pub lock_file: Option<PathBuf>,
    pub submit_cmd: String,
    pub status_cmd: String,
    pub cancel_cmd: String,
}

/// The optional `dataset` section (content-addressed datasets).
#[derive(Debug, Clone)]
pub struct DatasetConfig {
    pub input_dataset: String,
    pub output_dataset: Option<String>,
    pub input_branch: String,
    pub output_branch: String,
    pub branch_per_subject: bool,
    pub auto_push: bool,
}

/// The loaded, immutable configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub common: CommonConfig,
    pub app: AppConfig,
    pub cluster: Option<ClusterConfig>,
    pub dataset: Option<DatasetConfig>,
}

impl Config {
    /// Load and validate a configuration document.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value =
            serde_json::from_str(&text).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    /// Build a config from an already-parsed JSON document.
    pub fn from_value(mut value: Value) -> Result<Self, ConfigError> {
        // The GUI wraps configs in a project document: {"config": {...}}.
        if let Some(inner) = value.get("config") {
            if inner.get("common").is_some() {
                value = inner.clone();
            }
        }

        let root = value
            .as_object()
            .ok_or_else(|| ConfigError::Malformed("top level is not an object".into()))?;

        for key in root.keys() {
            if !matches!(key.as_str(), "common" | "app" | "cluster" | "dataset") {
                warn!(key, "ignoring unknown config section");
            }
        }

        let common_val = root
            .get("common")
            .ok_or_else(|| ConfigError::Semantic("config missing 'common' section".into()))?;
        let app_val = root
            .get("app")
            .ok_or_else(|| ConfigError::Semantic("config missing 'app' section".into()))?;

        let common = load_common(common_val)?;
        let app = load_app(app_val)?;
        let cluster = match root.get("cluster") {
            Some(v) if !v.is_null() => Some(load_cluster(v)?),
            _ => None,
        };
        let dataset = match root.get("dataset") {
            Some(v) if !v.is_null() => Some(load_dataset(v)?),
            _ => None,
        };

        Ok(Config {
            common,
            app,
            cluster,
            dataset,
        })
    }

    /// True when execution should go to a cluster scheduler by default.
    pub fn cluster_by_default(&self) -> bool {
        self.cluster.is_some()
    }
}

fn warn_unknown_keys(section: &str, value: &Value, known: &[&str]) -> Result<(), ConfigError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ConfigError::Malformed(format!("'{section}' section is not an object")))?;
    for key in obj.keys() {
        if !known.contains(&key.as_str()) {
            warn!(section, key, "ignoring unknown config key");
        }
    }
    Ok(())
}

fn get_str(section: &str, value: &Value, key: &str) -> Result<Option<String>, ConfigError> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ConfigError::Malformed(format!(
            "'{section}.{key}' must be a string"
        ))),
    }
}

fn require_str(section: &str, value: &Value, key: &str) -> Result<String, ConfigError> {
    get_str(section, value, key)?.ok_or_else(|| {
        ConfigError::Semantic(format!("missing required '{section}.{key}'"))
    })
}

fn absolutize(path: &str) -> Result<PathBuf, ConfigError> {
    std::path::absolute(path)
        .map_err(|e| ConfigError::Semantic(format!("cannot resolve path '{path}': {e}")))
}

fn load_common(value: &Value) -> Result<CommonConfig, ConfigError> {
    warn_unknown_keys(
        "common",
        value,
        &[
            "bids_folder",
            "output_folder",
            "tmp_folder",
            "container",
            "container_engine",
            "templateflow_dir",
            "apptainer_cachedir",
            "optional_folder",
            "jobs",
            "log_dir",
            "reports_dir",
            "container_locked",
            "grace_period_secs",
            "pilottest",
        ],
    )?;

    if value.get("pilottest").is_some() {
        warn!("'common.pilottest' is ignored; use --pilot on the command line");
    }

    let bids_folder = absolutize(&require_str("common", value, "bids_folder")?)?;
    if !bids_folder.is_dir() {
        return Err(ConfigError::Semantic(format!(
            "bids_folder is not a directory: {}",
            bids_folder.display()
        )));
    }

    let output_folder = absolutize(&require_str("common", value, "output_folder")?)?;
    let tmp_folder = absolutize(&require_str("common", value, "tmp_folder")?)?;
    for (key, dir) in [("output_folder", &output_folder), ("tmp_folder", &tmp_folder)] {
        fs::create_dir_all(dir).map_err(|e| {
            ConfigError::Semantic(format!("cannot create {key} {}: {e}", dir.display()))
        })?;
    }

    let container = absolutize(&require_str("common", value, "container")?)?;
    if !container.is_file() {
        return Err(ConfigError::Semantic(format!(
            "container image not found: {}",
            container.display()
        )));
    }

    let templateflow_dir = get_str("common", value, "templateflow_dir")?
        .map(|s| absolutize(&s))
        .transpose()?;
    let apptainer_cachedir = get_str("common", value, "apptainer_cachedir")?
        .map(|s| absolutize(&s))
        .transpose()?;
    let optional_folder = get_str("common", value, "optional_folder")?
        .map(|s| absolutize(&s))
        .transpose()?;
    if let Some(dir) = &optional_folder {
        if !dir.is_dir() {
            return Err(ConfigError::Semantic(format!(
                "optional_folder is not a directory: {}",
                dir.display()
            )));
        }
    }

    let default_jobs = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let jobs = match value.get("jobs") {
        None | Some(Value::Null) => default_jobs,
        Some(v) => {
            let n = v.as_u64().ok_or_else(|| {
                ConfigError::Semantic(format!("'common.jobs' must be a positive integer, got {v}"))
            })?;
            if n == 0 {
                return Err(ConfigError::Semantic(
                    "'common.jobs' must be at least 1".into(),
                ));
            }
            n as usize
        }
    };

    let log_dir = match get_str("common", value, "log_dir")? {
        Some(s) => absolutize(&s)?,
        None => absolutize("logs")?,
    };
    let reports_dir = match get_str("common", value, "reports_dir")? {
        Some(s) => absolutize(&s)?,
        None => log_dir.join("reports"),
    };

    let container_locked = value
        .get("container_locked")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let grace_period_secs = value
        .get("grace_period_secs")
        .and_then(Value::as_u64)
        .unwrap_or(10);

    Ok(CommonConfig {
        bids_folder,
        output_folder,
        tmp_folder,
        container,
        container_engine: get_str("common", value, "container_engine")?
            .unwrap_or_else(|| "apptainer".into()),
        templateflow_dir,
        apptainer_cachedir,
        optional_folder,
        jobs,
        log_dir,
        reports_dir,
        container_locked,
        grace_period_secs,
    })
}

fn string_list(section: &str, value: &Value, key: &str) -> Result<Vec<String>, ConfigError> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(String::from).ok_or_else(|| {
                    ConfigError::Malformed(format!("'{section}.{key}' must be a list of strings"))
                })
            })
            .collect(),
        Some(_) => Err(ConfigError::Malformed(format!(
            "'{section}.{key}' must be a list"
        ))),
    }
}

/// Drop malformed `--env` pairs from runtime arguments; a stray `--env`
/// without KEY=VALUE makes apptainer reject the whole invocation.
fn sanitize_runtime_args(args: Vec<String>) -> Vec<String> {
    let mut out = Vec::new();
    let mut iter = args.into_iter().peekable();
    while let Some(arg) = iter.next() {
        if let Some(rest) = arg.strip_prefix("--env=") {
            if !rest.contains('=') {
                warn!(arg, "ignoring invalid runtime arg");
                continue;
            }
            out.push(arg);
        } else if arg == "--env" {
            match iter.peek() {
                Some(next) if next.contains('=') && !next.starts_with('-') => {
                    out.push(arg);
                    out.push(iter.next().unwrap_or_default());
                }
                _ => warn!("ignoring invalid runtime arg '--env' (missing KEY=VALUE)"),
            }
        } else {
            out.push(arg);
        }
    }
    out
}

fn load_app(value: &Value) -> Result<AppConfig, ConfigError> {
    warn_unknown_keys(
        "app",
        value,
        &[
            "analysis_level",
            "options",
            "apptainer_args",
            "mounts",
            "output_check",
        ],
    )?;

    let analysis_level = AnalysisLevel::parse(&require_str("app", value, "analysis_level")?)?;
    let options = string_list("app", value, "options")?;
    let apptainer_args = sanitize_runtime_args(string_list("app", value, "apptainer_args")?);

    let mounts: Vec<Mount> = match value.get("mounts") {
        None | Some(Value::Null) => Vec::new(),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| ConfigError::Malformed(format!("'app.mounts' invalid: {e}")))?,
    };
    let mut resolved = Vec::with_capacity(mounts.len());
    for (i, mount) in mounts.into_iter().enumerate() {
        let source = absolutize(&mount.source.to_string_lossy())?;
        if !source.exists() {
            return Err(ConfigError::Semantic(format!(
                "mount {i} source does not exist: {}",
                source.display()
            )));
        }
        if !mount.target.is_absolute() {
            return Err(ConfigError::Semantic(format!(
                "mount {i} target must be an absolute path inside the container: {}",
                mount.target.display()
            )));
        }
        resolved.push(Mount {
            source,
            target: mount.target,
        });
    }

    let output_check: Option<OutputCheck> = match value.get("output_check") {
        None | Some(Value::Null) => None,
        Some(v) => {
            let check: OutputCheck = serde_json::from_value(v.clone())
                .map_err(|e| ConfigError::Malformed(format!("'app.output_check' invalid: {e}")))?;
            if check.pattern.is_empty() {
                warn!("'app.output_check' has an empty pattern; output checking disabled");
                None
            } else {
                Some(check)
            }
        }
    };

    Ok(AppConfig {
        analysis_level,
        options,
        apptainer_args,
        mounts: resolved,
        output_check,
    })
}

fn load_cluster(value: &Value) -> Result<ClusterConfig, ConfigError> {
    warn_unknown_keys(
        "cluster",
        value,
        &[
            "partition",
            "time",
            "mem",
            "cpus",
            "job_name",
            "modules",
            "environment",
            "output_pattern",
            "error_pattern",
            "monitor",
            "poll_interval_secs",
            "lock_file",
            "submit_cmd",
            "status_cmd",
            "cancel_cmd",
        ],
    )?;

    let partition = require_str("cluster", value, "partition")?;

    let time = require_str("cluster", value, "time")?;
    let time_re = Regex::new(r"^\d{1,2}:\d{2}:\d{2}$").expect("static regex");
    if !time_re.is_match(&time) {
        return Err(ConfigError::Semantic(format!(
            "cluster.time '{time}' does not match H:MM:SS or HH:MM:SS"
        )));
    }

    let mem = require_str("cluster", value, "mem")?;
    let mem_re = Regex::new(r"^\d+[MG]$").expect("static regex");
    if !mem_re.is_match(&mem) {
        return Err(ConfigError::Semantic(format!(
            "cluster.mem '{mem}' does not match <number>M or <number>G"
        )));
    }

    let cpus = value
        .get("cpus")
        .and_then(Value::as_u64)
        .ok_or_else(|| ConfigError::Semantic("missing required 'cluster.cpus'".into()))?;
    if cpus == 0 {
        return Err(ConfigError::Semantic("'cluster.cpus' must be at least 1".into()));
    }

    let environment: BTreeMap<String, String> = match value.get("environment") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| ConfigError::Malformed(format!("'cluster.environment' invalid: {e}")))?,
    };

    Ok(ClusterConfig {
        partition,
        time,
        mem,
        cpus: cpus as u32,
        job_name: get_str("cluster", value, "job_name")?.unwrap_or_else(|| "bids_app".into()),
        modules: string_list("cluster", value, "modules")?,
        environment,
        output_pattern: get_str("cluster", value, "output_pattern")?
            .unwrap_or_else(|| "slurm-%j.out".into()),
        error_pattern: get_str("cluster", value, "error_pattern")?
            .unwrap_or_else(|| "slurm-%j.err".into()),
        monitor: value.get("monitor").and_then(Value::as_bool).unwrap_or(false),
        poll_interval_secs: value
            .get("poll_interval_secs")
            .and_then(Value::as_u64)
            .unwrap_or(60),
        lock_file: get_str("cluster", value, "lock_file")?
            .map(|s| absolutize(&s))
            .transpose()?,
        submit_cmd: get_str("cluster", value, "submit_cmd")?.unwrap_or_else(|| "sbatch".into()),
        status_cmd: get_str("cluster", value, "status_cmd")?.unwrap_or_else(|| "squeue".into()),
        cancel_cmd: get_str("cluster", value, "cancel_cmd")?.unwrap_or_else(|| "scancel".into()),
    })
}

fn load_dataset(value: &Value) -> Result<DatasetConfig, ConfigError> {
    warn_unknown_keys(
        "dataset",
        value,
        &[
            "input_dataset",
            "output_dataset",
            "input_branch",
            "output_branch",
            "branch_per_subject",
            "auto_push",
        ],
    )?;

    let input_dataset = require_str("dataset", value, "input_dataset")?;
    if input_dataset.is_empty() {
        return Err(ConfigError::Semantic(
            "'dataset.input_dataset' must not be empty".into(),
        ));
    }

    let auto_push = value
        .get("auto_push")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let output_dataset = get_str("dataset", value, "output_dataset")?.filter(|s| !s.is_empty());
    if auto_push && output_dataset.is_none() {
        return Err(ConfigError::Semantic(
            "'dataset.auto_push' requires 'dataset.output_dataset'".into(),
        ));
    }

    Ok(DatasetConfig {
        input_dataset,
        output_dataset,
        input_branch: get_str("dataset", value, "input_branch")?.unwrap_or_else(|| "main".into()),
        output_branch: get_str("dataset", value, "output_branch")?
            .unwrap_or_else(|| "results".into()),
        branch_per_subject: value
            .get("branch_per_subject")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        auto_push,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs::File;
    use tempfile::TempDir;

    fn scaffold() -> (TempDir, Value) {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("bids")).unwrap();
        File::create(tmp.path().join("app.sif")).unwrap();
        let value = json!({
            "common": {
                "bids_folder": tmp.path().join("bids").to_string_lossy(),
                "output_folder": tmp.path().join("out").to_string_lossy(),
                "tmp_folder": tmp.path().join("work").to_string_lossy(),
                "container": tmp.path().join("app.sif").to_string_lossy(),
                "jobs": 2
            },
            "app": {
                "analysis_level": "participant"
            }
        });
        (tmp, value)
    }

    #[test]
    fn minimal_config_loads() {
        let (tmp, value) = scaffold();
        let config = Config::from_value(value).unwrap();
        assert_eq!(config.common.jobs, 2);
        assert!(config.common.output_folder.is_dir(), "output dir created");
        assert!(config.cluster.is_none());
        assert_eq!(config.app.analysis_level, AnalysisLevel::Participant);
        drop(tmp);
    }

    #[test]
    fn project_json_wrapper_is_unwrapped() {
        let (_tmp, value) = scaffold();
        let wrapped = json!({"config": value});
        assert!(Config::from_value(wrapped).is_ok());
    }

    #[test]
    fn missing_common_key_is_semantic() {
        let (_tmp, mut value) = scaffold();
        value["common"]
            .as_object_mut()
            .unwrap()
            .remove("container");
        let err = Config::from_value(value).unwrap_err();
        assert!(matches!(err, ConfigError::Semantic(_)), "{err}");
    }

    #[test]
    fn unknown_analysis_level_is_rejected() {
        let (_tmp, mut value) = scaffold();
        value["app"]["analysis_level"] = json!("session");
        let err = Config::from_value(value).unwrap_err();
        assert!(err.to_string().contains("analysis_level"));
    }

    #[test]
    fn zero_jobs_is_rejected() {
        let (_tmp, mut value) = scaffold();
        value["common"]["jobs"] = json!(0);
        assert!(Config::from_value(value).is_err());
    }

    #[test]
    fn mount_target_must_be_absolute() {
        let (tmp, mut value) = scaffold();
        value["app"]["mounts"] = json!([
            {"source": tmp.path().join("bids").to_string_lossy(), "target": "relative/path"}
        ]);
        let err = Config::from_value(value).unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn cluster_walltime_and_mem_are_validated() {
        let (_tmp, mut value) = scaffold();
        value["cluster"] = json!({
            "partition": "gpu", "time": "24:00", "mem": "32G", "cpus": 8
        });
        assert!(Config::from_value(value.clone()).is_err());

        value["cluster"]["time"] = json!("24:00:00");
        value["cluster"]["mem"] = json!("32Gb");
        assert!(Config::from_value(value.clone()).is_err());

        value["cluster"]["mem"] = json!("32G");
        let config = Config::from_value(value).unwrap();
        let cluster = config.cluster.unwrap();
        assert_eq!(cluster.submit_cmd, "sbatch");
        assert_eq!(cluster.poll_interval_secs, 60);
    }

    #[test]
    fn auto_push_requires_output_dataset() {
        let (_tmp, mut value) = scaffold();
        value["dataset"] = json!({"input_dataset": "ria+ssh://store#abc", "auto_push": true});
        assert!(Config::from_value(value.clone()).is_err());

        value["dataset"]["output_dataset"] = json!("ria+ssh://store#out");
        let config = Config::from_value(value).unwrap();
        let dataset = config.dataset.unwrap();
        assert!(dataset.auto_push);
        assert_eq!(dataset.input_branch, "main");
    }

    #[test]
    fn env_runtime_args_are_sanitized() {
        assert_eq!(
            sanitize_runtime_args(vec![
                "--containall".into(),
                "--env".into(),
                "KEY=value".into(),
                "--env".into(),
                "--cleanenv".into(),
                "--env=BROKEN".into(),
            ]),
            vec!["--containall", "--env", "KEY=value", "--cleanenv"]
        );
    }

    #[test]
    fn empty_output_check_pattern_is_dropped() {
        let (_tmp, mut value) = scaffold();
        value["app"]["output_check"] = json!({"pattern": ""});
        let config = Config::from_value(value).unwrap();
        assert!(config.app.output_check.is_none());
    }
}
