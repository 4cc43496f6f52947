//! Launch specifications and their resolution into a concrete command

use crate::config::ConfigStore;
use crate::types::LspError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Process flags for module launches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleMode {
    #[default]
    Run,
    Debug,
}

/// How to obtain a live connection to a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchSpec {
    /// Fixed binary. A relative path with a directory component is anchored
    /// at the install directory; a bare name is looked up on `PATH`.
    DirectExecutable { path: PathBuf, args: Vec<String> },

    /// Binary read from `config_key` at launch time. Extra arguments come
    /// from the sibling `args` key of the same section.
    ConfiguredExecutable {
        config_key: String,
        derived_args: Vec<String>,
    },

    /// `runtime [debug_options] module_path --stdio`
    ModuleStdio {
        runtime: PathBuf,
        module_path: PathBuf,
        mode: ModuleMode,
        debug_options: Vec<String>,
    },
}

/// What resolution may read
pub struct LaunchContext<'a> {
    pub config: &'a ConfigStore,
    pub install_dir: &'a Path,
    pub workspace_root: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

const INSTALL_DIR_VAR: &str = "${installDir}";
const WORKSPACE_ROOT_VAR: &str = "${workspaceRoot}";

impl LaunchSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            LaunchSpec::DirectExecutable { .. } => "direct",
            LaunchSpec::ConfiguredExecutable { .. } => "configured",
            LaunchSpec::ModuleStdio { .. } => "module",
        }
    }

    /// Resolve to a command line without starting anything.
    ///
    /// The only filesystem access is the existence check on an absolute
    /// configured path. A missing configured path is an error, never a
    /// fallback to some default binary.
    pub fn resolve(&self, ctx: &LaunchContext<'_>) -> Result<ResolvedCommand, LspError> {
        let (program, args) = match self {
            LaunchSpec::DirectExecutable { path, args } => (
                anchor(path, ctx.install_dir),
                args.iter().map(|arg| expand(arg, ctx)).collect(),
            ),

            LaunchSpec::ConfiguredExecutable {
                config_key,
                derived_args,
            } => {
                let configured = ctx
                    .config
                    .get_str(config_key)?
                    .ok_or_else(|| LspError::missing_key(config_key.as_str()))?;
                if configured.trim().is_empty() {
                    return Err(LspError::invalid_key(config_key.as_str(), "is empty"));
                }

                let program = anchor(Path::new(configured), ctx.workspace_root);
                if program.is_absolute() && !program.exists() {
                    return Err(LspError::invalid_key(
                        config_key.as_str(),
                        format!("points to {}, which does not exist", program.display()),
                    ));
                }

                let mut args: Vec<String> = derived_args.iter().map(|arg| expand(arg, ctx)).collect();
                let extra_key = args_key(config_key);
                if let Some(extra) = ctx.config.get_string_list(&extra_key)? {
                    args.extend(extra.iter().map(|arg| expand(arg, ctx)));
                }
                (program, args)
            }

            LaunchSpec::ModuleStdio {
                runtime,
                module_path,
                mode,
                debug_options,
            } => {
                let mut args = Vec::new();
                if *mode == ModuleMode::Debug {
                    args.extend(debug_options.iter().map(|arg| expand(arg, ctx)));
                }
                args.push(ctx.install_dir.join(module_path).display().to_string());
                args.push("--stdio".to_string());
                (anchor(runtime, ctx.install_dir), args)
            }
        };

        Ok(ResolvedCommand {
            program,
            args,
            cwd: ctx.workspace_root.to_path_buf(),
        })
    }
}

/// `dwsls.path` -> `dwsls.args`
fn args_key(config_key: &str) -> String {
    match config_key.rsplit_once('.') {
        Some((section, _)) => format!("{}.args", section),
        None => format!("{}.args", config_key),
    }
}

fn anchor(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() || path.components().count() == 1 {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn expand(arg: &str, ctx: &LaunchContext<'_>) -> String {
    arg.replace(INSTALL_DIR_VAR, &ctx.install_dir.display().to_string())
        .replace(WORKSPACE_ROOT_VAR, &ctx.workspace_root.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(config: &'a ConfigStore) -> LaunchContext<'a> {
        LaunchContext {
            config,
            install_dir: Path::new("/opt/dws"),
            workspace_root: Path::new("/work"),
        }
    }

    #[test]
    fn test_direct_anchors_relative_path_at_install_dir() {
        let spec = LaunchSpec::DirectExecutable {
            path: PathBuf::from("bin/dwsc.exe"),
            args: vec!["ls".to_string()],
        };
        let config = ConfigStore::new();
        let command = spec.resolve(&ctx(&config)).unwrap();

        assert_eq!(command.program, PathBuf::from("/opt/dws/bin/dwsc.exe"));
        assert_eq!(command.args, vec!["ls".to_string()]);
        assert_eq!(command.cwd, PathBuf::from("/work"));
    }

    #[test]
    fn test_direct_bare_name_left_for_path_lookup() {
        let spec = LaunchSpec::DirectExecutable {
            path: PathBuf::from("cat"),
            args: vec![],
        };
        let config = ConfigStore::new();
        assert_eq!(spec.resolve(&ctx(&config)).unwrap().program, PathBuf::from("cat"));
    }

    #[test]
    fn test_configured_missing_path_names_key() {
        let spec = LaunchSpec::ConfiguredExecutable {
            config_key: "dwsls.path".to_string(),
            derived_args: vec![],
        };
        let config = ConfigStore::new();
        let err = spec.resolve(&ctx(&config)).unwrap_err();
        assert_eq!(err.config_key(), Some("dwsls.path"));
    }

    #[test]
    fn test_configured_empty_path_rejected() {
        let spec = LaunchSpec::ConfiguredExecutable {
            config_key: "dwsls.path".to_string(),
            derived_args: vec![],
        };
        let mut config = ConfigStore::new();
        config.set("dwsls.path", "  ");
        let err = spec.resolve(&ctx(&config)).unwrap_err();
        assert_eq!(err.config_key(), Some("dwsls.path"));
    }

    #[test]
    fn test_configured_absolute_path_must_exist() {
        let spec = LaunchSpec::ConfiguredExecutable {
            config_key: "dwsls.path".to_string(),
            derived_args: vec![],
        };
        let mut config = ConfigStore::new();
        config.set("dwsls.path", "/definitely/not/here/mono");
        let err = spec.resolve(&ctx(&config)).unwrap_err();
        assert_eq!(err.config_key(), Some("dwsls.path"));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_configured_expands_derived_and_appends_extra_args() {
        let interpreter = tempfile::NamedTempFile::new().unwrap();
        let spec = LaunchSpec::ConfiguredExecutable {
            config_key: "dwsls.path".to_string(),
            derived_args: vec!["${installDir}/bin/DWScript.exe".to_string()],
        };
        let mut config = ConfigStore::new();
        config.set("dwsls.path", interpreter.path().display().to_string());
        config.set(
            "dwsls.args",
            toml::Value::Array(vec!["--root".into(), "${workspaceRoot}".into()]),
        );

        let command = spec.resolve(&ctx(&config)).unwrap();
        assert_eq!(command.program, interpreter.path());
        assert_eq!(
            command.args,
            vec![
                "/opt/dws/bin/DWScript.exe".to_string(),
                "--root".to_string(),
                "/work".to_string(),
            ]
        );
    }

    #[test]
    fn test_configured_bad_args_names_args_key() {
        let spec = LaunchSpec::ConfiguredExecutable {
            config_key: "dwsls.path".to_string(),
            derived_args: vec![],
        };
        let mut config = ConfigStore::new();
        config.set("dwsls.path", "mono");
        config.set("dwsls.args", 3);
        let err = spec.resolve(&ctx(&config)).unwrap_err();
        assert_eq!(err.config_key(), Some("dwsls.args"));
    }

    #[test]
    fn test_module_modes_differ_only_in_flags() {
        let run = LaunchSpec::ModuleStdio {
            runtime: PathBuf::from("node"),
            module_path: PathBuf::from("server/out/server.js"),
            mode: ModuleMode::Run,
            debug_options: vec!["/debug".to_string()],
        };
        let debug = LaunchSpec::ModuleStdio {
            runtime: PathBuf::from("node"),
            module_path: PathBuf::from("server/out/server.js"),
            mode: ModuleMode::Debug,
            debug_options: vec!["/debug".to_string()],
        };
        let config = ConfigStore::new();

        let run = run.resolve(&ctx(&config)).unwrap();
        let debug = debug.resolve(&ctx(&config)).unwrap();

        assert_eq!(run.program, debug.program);
        assert_eq!(
            run.args,
            vec!["/opt/dws/server/out/server.js".to_string(), "--stdio".to_string()]
        );
        assert_eq!(
            debug.args,
            vec![
                "/debug".to_string(),
                "/opt/dws/server/out/server.js".to_string(),
                "--stdio".to_string()
            ]
        );
    }

    #[test]
    fn test_args_key() {
        assert_eq!(args_key("dwsls.path"), "dwsls.args");
        assert_eq!(args_key("a.b.path"), "a.b.args");
        assert_eq!(args_key("path"), "path.args");
    }
}
