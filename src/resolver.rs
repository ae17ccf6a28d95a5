//! Maps inbound webhook payloads to configured projects.

use std::sync::Arc;

use serde_json::Value;

use crate::config::Project;

/// Extract the `owner/repo` identifier from a webhook payload.
///
/// GitHub and Bitbucket both send `repository.full_name` for push and
/// pull/merge-request events, so a single field covers both providers.
pub fn detect_project(payload: &Value) -> Option<String> {
    payload
        .get("repository")?
        .get("full_name")?
        .as_str()
        .map(str::to_string)
}

/// Parse the `owner/name` slug out of a git remote URL.
///
/// Handles:
/// - scp-like SSH: `git@github.com:owner/repo.git`
/// - URL forms: `ssh://git@host:22/owner/repo.git`, `https://user@host/owner/repo`,
///   `git://host/owner/repo.git`, `file:///srv/git/owner/repo.git`
/// - plain local paths: `/srv/git/owner/repo.git`
pub fn parse_full_name(url: &str) -> Option<String> {
    let url = url.trim();
    let path = if let Some(idx) = url.find("://") {
        let rest = &url[idx + 3..];
        match rest.find('/') {
            Some(slash) => &rest[slash..],
            None => return None,
        }
    } else if let Some(colon) = url.find(':')
        && !url[..colon].contains('/')
    {
        &url[colon + 1..]
    } else {
        url
    };

    let path = path.trim_end_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);

    let mut segments = path.rsplit('/').filter(|s| !s.is_empty());
    let name = segments.next()?;
    let owner = segments.next()?;
    Some(format!("{}/{}", owner, name))
}

/// Config-backed project lookup. Built once at startup.
#[derive(Debug, Clone)]
pub struct Resolver {
    entries: Arc<[(Option<String>, Project)]>,
}

impl Resolver {
    pub fn new(projects: Vec<Project>) -> Self {
        let entries: Vec<_> = projects
            .into_iter()
            .map(|p| (parse_full_name(&p.repo.url), p))
            .collect();
        Self {
            entries: entries.into(),
        }
    }

    /// Every configured project, in configuration order.
    pub fn projects(&self) -> impl Iterator<Item = &Project> {
        self.entries.iter().map(|(_, p)| p)
    }

    /// All projects whose repository slug equals `full_name` exactly.
    ///
    /// The same repository may be configured several times (one entry per
    /// branch, for example), so any number of matches is valid.
    pub fn find_projects(&self, full_name: &str) -> Vec<Project> {
        self.entries
            .iter()
            .filter(|(name, project)| {
                tracing::debug!(project = %project.key, repo = ?name, incoming = full_name, "matching project");
                name.as_deref() == Some(full_name)
            })
            .map(|(_, project)| project.clone())
            .collect()
    }
}
