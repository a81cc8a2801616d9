//! Child process environment resolution for stdio backends.

use std::collections::HashMap;

use crate::config::interpolate_env_vars;

/// Variable carrying the active project name into backend processes.
pub const PROJECT_ENV_VAR: &str = "ASSERN_PROJECT";

/// Builds the complete environment a backend process is spawned with.
pub trait EnvironmentBuilder: Send + Sync {
    fn build(
        &self,
        declared: &HashMap<String, String>,
        project: Option<&str>,
    ) -> HashMap<String, String>;
}

/// Default builder: parent environment overlaid with the declared variables.
///
/// Declared values go through `${VAR}` / `${VAR:-default}` interpolation
/// again so descriptors built in code behave like ones loaded from a file.
#[derive(Debug, Clone)]
pub struct ProcessEnvironment {
    inherit: bool,
}

impl ProcessEnvironment {
    pub fn new() -> Self {
        Self { inherit: true }
    }

    /// Only declared variables (and the project name) reach the child.
    pub fn isolated() -> Self {
        Self { inherit: false }
    }
}

impl Default for ProcessEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentBuilder for ProcessEnvironment {
    fn build(
        &self,
        declared: &HashMap<String, String>,
        project: Option<&str>,
    ) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = if self.inherit {
            std::env::vars().collect()
        } else {
            HashMap::new()
        };

        for (key, value) in declared {
            env.insert(key.clone(), interpolate_env_vars(value));
        }

        if let Some(project) = project.filter(|p| !p.is_empty()) {
            env.insert(PROJECT_ENV_VAR.to_string(), project.to_string());
        }

        env
    }
}
