//! Server definition types

use crate::lsp::launch::{LaunchSpec, ModuleMode};
use crate::sync::SyncPolicy;
use crate::types::LspError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDefinition {
    /// Server identity, also the session registry key
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// Document selector
    pub languages: Vec<String>,
    pub launch: LaunchTemplate,
    pub sync: SyncTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LaunchTemplate {
    Direct {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
    Configured {
        config_key: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Module {
        runtime: PathBuf,
        module: PathBuf,
        #[serde(default = "default_debug_options")]
        debug_options: Vec<String>,
    },
}

fn default_debug_options() -> Vec<String> {
    vec!["/debug".to_string()]
}

impl LaunchTemplate {
    pub fn kind(&self) -> &'static str {
        match self {
            LaunchTemplate::Direct { .. } => "direct",
            LaunchTemplate::Configured { .. } => "configured",
            LaunchTemplate::Module { .. } => "module",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTemplate {
    pub configuration_section: String,
    #[serde(default)]
    pub file_events: Vec<String>,
}

impl ServerDefinition {
    /// Only module launches distinguish run and debug; other templates ignore `mode`.
    pub fn launch_spec(&self, mode: ModuleMode) -> LaunchSpec {
        match &self.launch {
            LaunchTemplate::Direct { program, args } => LaunchSpec::DirectExecutable {
                path: program.clone(),
                args: args.clone(),
            },
            LaunchTemplate::Configured { config_key, args } => LaunchSpec::ConfiguredExecutable {
                config_key: config_key.clone(),
                derived_args: args.clone(),
            },
            LaunchTemplate::Module {
                runtime,
                module,
                debug_options,
            } => LaunchSpec::ModuleStdio {
                runtime: runtime.clone(),
                module_path: module.clone(),
                mode,
                debug_options: debug_options.clone(),
            },
        }
    }

    pub fn sync_policy(&self) -> Result<SyncPolicy, LspError> {
        SyncPolicy::new(
            self.languages.iter().cloned(),
            self.sync.configuration_section.clone(),
            self.sync.file_events.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_configured_definition() {
        let def: ServerDefinition = toml::from_str(
            r#"
            id = "dwsls"
            name = "DWScript Language Server"
            languages = ["dws"]

            [launch]
            type = "configured"
            config_key = "dwsls.path"
            args = ["${installDir}/bin/DWScript.exe"]

            [sync]
            configuration_section = "dws"
            file_events = ["**/*.dws"]
            "#,
        )
        .unwrap();

        assert_eq!(def.launch.kind(), "configured");
        assert_eq!(
            def.launch_spec(ModuleMode::Debug),
            LaunchSpec::ConfiguredExecutable {
                config_key: "dwsls.path".to_string(),
                derived_args: vec!["${installDir}/bin/DWScript.exe".to_string()],
            }
        );

        let policy = def.sync_policy().unwrap();
        assert!(policy.handles_language("dws"));
        assert_eq!(policy.config_section(), "dws");
        assert_eq!(policy.watch_globs(), ["**/*.dws".to_string()]);
    }

    #[test]
    fn test_module_definition_defaults_debug_options() {
        let def: ServerDefinition = toml::from_str(
            r#"
            name = "Module server"
            languages = ["dws"]

            [launch]
            type = "module"
            runtime = "node"
            module = "server/out/server.js"

            [sync]
            configuration_section = "dws"
            "#,
        )
        .unwrap();

        match def.launch_spec(ModuleMode::Debug) {
            LaunchSpec::ModuleStdio {
                mode,
                debug_options,
                ..
            } => {
                assert_eq!(mode, ModuleMode::Debug);
                assert_eq!(debug_options, vec!["/debug".to_string()]);
            }
            other => panic!("expected module launch, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_language_list_rejected() {
        let def = ServerDefinition {
            id: "broken".to_string(),
            name: "Broken".to_string(),
            languages: vec![],
            launch: LaunchTemplate::Direct {
                program: PathBuf::from("cat"),
                args: vec![],
            },
            sync: SyncTemplate {
                configuration_section: "broken".to_string(),
                file_events: vec![],
            },
        };
        assert!(matches!(def.sync_policy(), Err(LspError::InvalidPolicy(_))));
    }
}
