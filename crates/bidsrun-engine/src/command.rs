//! Container invocation builder.
//!
//! Pure construction: config + unit + per-run paths in, a structured
//! command descriptor out. The dispatchers own spawning, so tests can
//! exercise argument construction without executing anything.

use std::path::{Path, PathBuf};

use bidsrun_types::Unit;

use crate::config::Config;

/// Guest mount points, fixed across backends.
pub const GUEST_BIDS: &str = "/bids";
pub const GUEST_OUTPUT: &str = "/output";
pub const GUEST_SCRATCH: &str = "/tmp";
pub const GUEST_TEMPLATEFLOW: &str = "/templateflow";
pub const GUEST_CACHE: &str = "/cache";
pub const GUEST_BASE: &str = "/base";

/// A fully-described process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Environment for the spawned runtime process, duplicate-free with
    /// the allow-list entries first. Guest-visible values travel as
    /// `--env` arguments in `args`; this vector is the host-side copy the
    /// dispatchers apply (local: process env, cluster: script exports).
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// Where the child's stdout goes. Equal to `stderr_path` outside debug
    /// mode (one combined per-unit log).
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
}

impl CommandSpec {
    /// Render as a single shell line (dry-run output, job scripts).
    pub fn shell_line(&self) -> String {
        let mut parts = vec![quote(&self.program)];
        parts.extend(self.args.iter().map(|a| quote(a)));
        parts.join(" ")
    }
}

fn quote(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
        format!("'{}'", arg.replace('\'', r"'\''"))
    } else {
        arg.to_string()
    }
}

/// Builds the container invocation for one unit.
#[derive(Debug, Clone)]
pub struct CommandBuilder<'a> {
    config: &'a Config,
    debug: bool,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(config: &'a Config, debug: bool) -> Self {
        Self { config, debug }
    }

    /// Build the invocation for `unit` with its private scratch directory.
    ///
    /// `log_stamp` keys the per-unit log file names (one timestamp per
    /// dispatch round keeps re-runs apart).
    pub fn build(&self, unit: &Unit, scratch_dir: &Path, log_stamp: &str) -> CommandSpec {
        let common = &self.config.common;
        let app = &self.config.app;

        let mut args = vec!["run".to_string()];
        if app.apptainer_args.is_empty() {
            args.push("--containall".into());
        } else {
            args.extend(app.apptainer_args.iter().cloned());
        }

        // Bind mounts: scratch, output, dataset, then the optional roots,
        // then app extras in declared order.
        let mut bind = |host: &Path, guest: &str| {
            args.push("-B".into());
            args.push(format!("{}:{}", host.display(), guest));
        };
        bind(scratch_dir, GUEST_SCRATCH);
        bind(&common.output_folder, GUEST_OUTPUT);
        bind(&common.bids_folder, GUEST_BIDS);
        if let Some(dir) = &common.templateflow_dir {
            bind(dir, GUEST_TEMPLATEFLOW);
        }
        if let Some(dir) = &common.apptainer_cachedir {
            bind(dir, GUEST_CACHE);
        }
        if let Some(dir) = &common.optional_folder {
            bind(dir, GUEST_BASE);
        }
        for mount in &app.mounts {
            bind(&mount.source, &mount.target.to_string_lossy());
        }

        // The env allow-list travels as --env args: --containall implies a
        // clean guest environment, so host-process env never reaches the
        // container.
        let cache_dir = if common.apptainer_cachedir.is_some() {
            GUEST_CACHE
        } else {
            GUEST_SCRATCH
        };
        args.push("--env".into());
        args.push(format!("TEMPLATEFLOW_HOME={GUEST_TEMPLATEFLOW}"));
        args.push("--env".into());
        args.push(format!("APPTAINER_CACHEDIR={cache_dir}"));
        args.push("--env".into());
        args.push(format!("TMPDIR={GUEST_SCRATCH}"));
        args.push(common.container.display().to_string());

        // BIDS App positionals, unit selector, pass-through options.
        args.push(GUEST_BIDS.into());
        args.push(GUEST_OUTPUT.into());
        args.push(app.analysis_level.as_str().into());
        if !unit.is_group() {
            args.push("--participant-label".into());
            args.push(unit.subject.clone());
            if let Some(session) = &unit.session {
                args.push("--session-id".into());
                args.push(session.clone());
            }
        }
        args.extend(app.options.iter().cloned());
        args.push("-w".into());
        args.push(GUEST_SCRATCH.into());

        // Allow-list first, then the cluster map; first entry wins per key
        // so user-supplied values cannot shadow the allow-list.
        let mut env = vec![
            ("TEMPLATEFLOW_HOME".to_string(), GUEST_TEMPLATEFLOW.to_string()),
            ("APPTAINER_CACHEDIR".to_string(), cache_dir.to_string()),
            ("TMPDIR".to_string(), GUEST_SCRATCH.to_string()),
        ];
        if let Some(cluster) = &self.config.cluster {
            for (k, v) in &cluster.environment {
                if env.iter().any(|(key, _)| key == k) {
                    continue;
                }
                env.push((k.clone(), v.clone()));
            }
        }

        let key = unit.key();
        let (stdout_path, stderr_path) = if self.debug {
            (
                Some(common.log_dir.join(format!("unit_{key}_{log_stamp}.out"))),
                Some(common.log_dir.join(format!("unit_{key}_{log_stamp}.err"))),
            )
        } else {
            let log = common.log_dir.join(format!("unit_{key}_{log_stamp}.log"));
            (Some(log.clone()), Some(log))
        };

        CommandSpec {
            program: common.container_engine.clone(),
            args,
            env,
            cwd: None,
            stdout_path,
            stderr_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs::{self, File};
    use tempfile::TempDir;

    fn test_config(extra_app: serde_json::Value) -> (TempDir, Config) {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("bids")).unwrap();
        fs::create_dir_all(tmp.path().join("atlas")).unwrap();
        File::create(tmp.path().join("app.sif")).unwrap();
        let mut app = json!({"analysis_level": "participant"});
        app.as_object_mut()
            .unwrap()
            .extend(extra_app.as_object().cloned().unwrap_or_default());
        let config = Config::from_value(json!({
            "common": {
                "bids_folder": tmp.path().join("bids").to_string_lossy(),
                "output_folder": tmp.path().join("out").to_string_lossy(),
                "tmp_folder": tmp.path().join("work").to_string_lossy(),
                "log_dir": tmp.path().join("logs").to_string_lossy(),
                "container": tmp.path().join("app.sif").to_string_lossy(),
            },
            "app": app
        }))
        .unwrap();
        (tmp, config)
    }

    #[test]
    fn baseline_invocation_shape() {
        let (tmp, config) = test_config(json!({}));
        let builder = CommandBuilder::new(&config, false);
        let scratch = tmp.path().join("work/001");
        let spec = builder.build(&Unit::subject("001"), &scratch, "20250101_000000");

        assert_eq!(spec.program, "apptainer");
        assert_eq!(spec.args[0], "run");
        assert_eq!(spec.args[1], "--containall");

        let line = spec.shell_line();
        assert!(line.contains(&format!("-B {}:/tmp", scratch.display())));
        assert!(line.contains(":/output"));
        assert!(line.contains(":/bids"));
        assert!(line.contains("/bids /output participant"));
        assert!(line.contains("--participant-label 001"));
        assert!(line.ends_with("-w /tmp"));
        assert!(!line.contains("--session-id"));
    }

    #[test]
    fn options_follow_the_unit_selector() {
        let (tmp, config) = test_config(json!({
            "options": ["--fs-no-reconall", "--output-spaces", "MNI152NLin2009cAsym"]
        }));
        let spec = CommandBuilder::new(&config, false).build(
            &Unit::subject("001"),
            &tmp.path().join("work/001"),
            "ts",
        );
        let args = &spec.args;
        let selector = args.iter().position(|a| a == "--participant-label").unwrap();
        let option = args.iter().position(|a| a == "--fs-no-reconall").unwrap();
        assert!(option > selector, "options come after the unit selector");
    }

    #[test]
    fn session_units_add_session_selector() {
        let (tmp, config) = test_config(json!({}));
        let spec = CommandBuilder::new(&config, false).build(
            &Unit::session("01", "02"),
            &tmp.path().join("work/x"),
            "ts",
        );
        let line = spec.shell_line();
        assert!(line.contains("--participant-label 01"));
        assert!(line.contains("--session-id 02"));
    }

    #[test]
    fn group_unit_has_no_selector() {
        let (tmp, mut config) = test_config(json!({}));
        config.app.analysis_level = crate::config::AnalysisLevel::Group;
        let spec = CommandBuilder::new(&config, false).build(
            &Unit::group(),
            &tmp.path().join("work/group"),
            "ts",
        );
        let line = spec.shell_line();
        assert!(line.contains("/bids /output group"));
        assert!(!line.contains("--participant-label"));
    }

    #[test]
    fn extra_mounts_and_runtime_args_are_kept_in_order() {
        let (tmp, config) = test_config(json!({"apptainer_args": ["--cleanenv"]}));
        let mut config = config;
        config.app.mounts.push(crate::config::Mount {
            source: tmp.path().join("atlas"),
            target: "/atlas".into(),
        });
        let spec = CommandBuilder::new(&config, false).build(
            &Unit::subject("001"),
            &tmp.path().join("work/001"),
            "ts",
        );
        let line = spec.shell_line();
        assert!(line.contains("--cleanenv"));
        assert!(!line.contains("--containall"));
        assert!(line.contains(":/atlas"));
    }

    #[test]
    fn debug_splits_log_sinks() {
        let (tmp, config) = test_config(json!({}));
        let unit = Unit::subject("001");
        let scratch = tmp.path().join("work/001");

        let plain = CommandBuilder::new(&config, false).build(&unit, &scratch, "ts");
        assert_eq!(plain.stdout_path, plain.stderr_path);
        assert!(plain
            .stdout_path
            .as_ref()
            .unwrap()
            .ends_with("unit_001_ts.log"));

        let debug = CommandBuilder::new(&config, true).build(&unit, &scratch, "ts");
        assert_ne!(debug.stdout_path, debug.stderr_path);
        assert!(debug
            .stdout_path
            .as_ref()
            .unwrap()
            .ends_with("unit_001_ts.out"));
        assert!(debug
            .stderr_path
            .as_ref()
            .unwrap()
            .ends_with("unit_001_ts.err"));
    }

    #[test]
    fn env_allow_list_reaches_the_guest() {
        let (tmp, config) = test_config(json!({}));
        let spec = CommandBuilder::new(&config, false).build(
            &Unit::subject("001"),
            &tmp.path().join("w"),
            "ts",
        );
        // Guest-visible: --containall strips host env, so each allow-list
        // entry must appear as an --env argument.
        let line = spec.shell_line();
        assert!(line.contains("--env TEMPLATEFLOW_HOME=/templateflow"));
        assert!(line.contains("--env APPTAINER_CACHEDIR=/tmp"));
        assert!(line.contains("--env TMPDIR=/tmp"));
        // Host-side copy matches.
        assert!(spec
            .env
            .contains(&("TEMPLATEFLOW_HOME".into(), "/templateflow".into())));
        assert!(spec
            .env
            .contains(&("APPTAINER_CACHEDIR".into(), "/tmp".into())));
        assert!(spec.env.contains(&("TMPDIR".into(), "/tmp".into())));
    }

    #[test]
    fn configured_cache_dir_is_bound_and_exported() {
        let (tmp, mut config) = test_config(json!({}));
        fs::create_dir_all(tmp.path().join("cache")).unwrap();
        config.common.apptainer_cachedir = Some(tmp.path().join("cache"));

        let spec = CommandBuilder::new(&config, false).build(
            &Unit::subject("001"),
            &tmp.path().join("w"),
            "ts",
        );
        let line = spec.shell_line();
        assert!(line.contains(&format!("-B {}:/cache", tmp.path().join("cache").display())));
        assert!(line.contains("--env APPTAINER_CACHEDIR=/cache"));
        assert!(!line.contains("APPTAINER_CACHEDIR=/tmp"));
    }

    #[test]
    fn shell_line_quotes_whitespace() {
        let spec = CommandSpec {
            program: "echo".into(),
            args: vec!["two words".into(), "plain".into()],
            env: vec![],
            cwd: None,
            stdout_path: None,
            stderr_path: None,
        };
        assert_eq!(spec.shell_line(), "echo 'two words' plain");
    }
}
