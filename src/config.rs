//! Daemon configuration loaded once at startup from `conf/config.json`.
//!
//! ```json
//! {
//!   "port": 8080,
//!   "webhook": { "path": "/webhook", "method": "POST" },
//!   "slack": {
//!     "webhookUrl": "https://hooks.slack.com/services/...",
//!     "channel": "#builds",
//!     "username": "hookci",
//!     "icon": ":construction_worker:"
//!   },
//!   "projects": [
//!     {
//!       "key": "api",
//!       "repo": { "url": "git@github.com:acme/api.git", "branch": "master" },
//!       "buildScript": "/opt/ci/api-build.sh"
//!     }
//!   ]
//! }
//! ```
//!
//! The project list is immutable for the lifetime of the process.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use axum::http::Method;
use axum::routing::MethodFilter;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::git::validate_branch;
use crate::resolver::parse_full_name;

/// Chat webhook target for notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackConfig {
    pub webhook_url: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

/// Remote repository tracked by a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub url: String,
    pub branch: String,
}

/// One watched repository and how to build it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub key: String,
    pub repo: RepoConfig,
    /// Working copy location; defaults to `<data_dir>/workspaces/<key>`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    pub build_script: PathBuf,
    #[serde(default)]
    pub slack: Option<SlackConfig>,
}

impl Project {
    /// Resolve the on-disk working copy for this project.
    pub fn working_copy(&self, data_dir: &Path) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => data_dir.join("workspaces").join(&self.key),
        }
    }
}

/// The single route the listener accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRoute {
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
}

fn default_method() -> String {
    "POST".to_string()
}

impl Default for WebhookRoute {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            method: default_method(),
        }
    }
}

impl WebhookRoute {
    /// The path must be a literal route: absolute, no trailing slash, and
    /// free of router capture or wildcard syntax.
    pub fn check_path(&self) -> Result<(), ConfigError> {
        let path = self.path.as_str();
        let invalid = |why: &str| Err(ConfigError::InvalidRoute(format!("path '{}' {}", path, why)));

        if !path.starts_with('/') {
            return invalid("must start with '/'");
        }
        if path.len() > 1 && path.ends_with('/') {
            return invalid("must not end with '/'");
        }
        if path.contains(['{', '}', '*']) {
            return invalid("must not contain '{', '}' or '*'");
        }
        if path.split('/').any(|segment| segment.starts_with(':')) {
            return invalid("must not contain ':' captures");
        }
        if path.len() > 1 && path[1..].split('/').any(str::is_empty) {
            return invalid("must not contain empty segments");
        }
        Ok(())
    }

    /// Method filter used to mount the route.
    pub fn method_filter(&self) -> Result<MethodFilter, ConfigError> {
        let method = Method::from_bytes(self.method.to_uppercase().as_bytes())
            .map_err(|_| ConfigError::InvalidRoute(format!("unknown method '{}'", self.method)))?;
        MethodFilter::try_from(method)
            .map_err(|_| ConfigError::InvalidRoute(format!("unsupported method '{}'", self.method)))
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub webhook: WebhookRoute,
    #[serde(default)]
    pub slack: Option<SlackConfig>,
    #[serde(default)]
    pub projects: Vec<Project>,
}

fn default_port() -> u16 {
    8080
}

impl DaemonConfig {
    /// Read, parse, and validate the configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let config: DaemonConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::ParseFailed {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that serde alone cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssl {
            return Err(ConfigError::TlsUnsupported);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }
        self.webhook.check_path()?;
        self.webhook.method_filter()?;

        let mut seen = HashSet::new();
        for project in &self.projects {
            let invalid = |message: &str| ConfigError::InvalidProject {
                key: project.key.clone(),
                message: message.to_string(),
            };

            if project.key.trim().is_empty() {
                return Err(invalid("key must not be empty"));
            }
            if project.key.contains(['/', '\\']) || project.key == "." || project.key == ".." {
                return Err(invalid("key must be a plain directory name"));
            }
            if !seen.insert(project.key.as_str()) {
                return Err(ConfigError::DuplicateKey {
                    key: project.key.clone(),
                });
            }
            if parse_full_name(&project.repo.url).is_none() {
                return Err(invalid("repo.url has no owner/name"));
            }
            if !validate_branch(&project.repo.branch) {
                return Err(invalid("repo.branch is not a valid branch name"));
            }
            if project.build_script.as_os_str().is_empty() {
                return Err(invalid("buildScript must not be empty"));
            }
            if let Some(slack) = &project.slack
                && slack.webhook_url.is_empty()
            {
                return Err(invalid("slack.webhookUrl must not be empty"));
            }
        }
        Ok(())
    }
}
