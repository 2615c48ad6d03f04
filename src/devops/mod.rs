//! Azure DevOps REST API access: the subset of repositories, pull requests,
//! commits and work items the fleet workflow needs.

mod client;
#[cfg(test)]
pub(crate) mod fake;

use std::{collections::HashMap, str::FromStr};

use serde::{Deserialize, Serialize};

pub use client::DevOpsClient;

use crate::{pull_request::PullRequestPayload, work_items::WorkItem};

pub const HEADS_PREFIX: &str = "refs/heads/";

/// `develop` -> `refs/heads/develop`; already-qualified refs pass through.
pub fn branch_ref(branch: &str) -> String {
    if branch.starts_with(HEADS_PREFIX) {
        branch.to_string()
    } else {
        format!("{}{}", HEADS_PREFIX, branch)
    }
}

/// `refs/heads/develop` -> `develop`
pub fn strip_branch_ref(ref_name: &str) -> &str {
    ref_name.strip_prefix(HEADS_PREFIX).unwrap_or(ref_name)
}

// ============== API Response Types ==============

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepository {
    pub id: String,
    pub name: String,
    /// Team project the repository was looked up in.
    #[serde(skip)]
    pub project: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PullRequestStatus {
    NotSet,
    Active,
    Abandoned,
    Completed,
    All,
}

impl PullRequestStatus {
    pub fn as_query(&self) -> &'static str {
        match self {
            Self::NotSet => "notSet",
            Self::Active => "active",
            Self::Abandoned => "abandoned",
            Self::Completed => "completed",
            Self::All => "all",
        }
    }
}

impl std::fmt::Display for PullRequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_query())
    }
}

impl FromStr for PullRequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" | "active" => Ok(Self::Active),
            "c" | "completed" => Ok(Self::Completed),
            "b" | "abandoned" => Ok(Self::Abandoned),
            "all" => Ok(Self::All),
            other => Err(format!(
                "unknown pull request status '{}' (expected a, c, b or all)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitPullRequest {
    pub pull_request_id: u64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub source_ref_name: String,
    pub target_ref_name: String,
    pub status: PullRequestStatus,
    #[serde(default)]
    pub is_draft: bool,
}

impl GitPullRequest {
    pub fn matches_refs(&self, source_ref: &str, target_ref: &str) -> bool {
        self.source_ref_name == source_ref && self.target_ref_name == target_ref
    }
}

/// Link from a commit or pull request to a work item.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRef {
    pub commit_id: String,
    #[serde(default)]
    pub work_items: Vec<ResourceRef>,
}

impl CommitRef {
    /// Linked work item ids; refs with non-numeric ids are ignored.
    pub fn work_item_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.work_items.iter().filter_map(|work_item| {
            work_item
                .id
                .parse()
                .inspect_err(|_| tracing::debug!("Ignoring work item ref '{}'", work_item.id))
                .ok()
        })
    }
}

/// Work item as returned by the batch endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RawWorkItem {
    pub id: u64,
    #[serde(default)]
    pub fields: HashMap<String, serde_json::Value>,
}

impl RawWorkItem {
    fn field(&self, name: &str) -> Option<String> {
        self.fields
            .get(name)
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
    }

    pub fn into_work_item(self, url: String) -> WorkItem {
        WorkItem {
            id: self.id,
            title: self.field("System.Title").unwrap_or_default(),
            work_item_type: self.field("System.WorkItemType"),
            area_path: self.field("System.AreaPath"),
            iteration_path: self.field("System.IterationPath"),
            state: self.field("System.State"),
            url,
        }
    }
}

/// Filter for listing pull requests.
#[derive(Debug, Clone, Default)]
pub struct PullRequestQuery {
    pub status: Option<PullRequestStatus>,
    pub top: Option<u32>,
    pub source_ref: Option<String>,
    pub target_ref: Option<String>,
}

impl PullRequestQuery {
    pub fn for_refs(status: PullRequestStatus, source_ref: &str, target_ref: &str) -> Self {
        Self {
            status: Some(status),
            top: None,
            source_ref: Some(source_ref.to_string()),
            target_ref: Some(target_ref.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeStrategy {
    NoFastForward,
}

// ============== Error Types ==============

#[derive(Debug)]
pub enum DevOpsError {
    /// No personal access token configured
    NoToken,
    /// Token is invalid, expired or lacks scope
    Unauthorized,
    /// Repository, branch or pull request does not exist
    NotFound(String),
    /// Request exceeded the per-call timeout
    Timeout,
    /// Throttling, server-side or connection failure worth retrying
    Transient { status: Option<u16>, message: String },
    /// The run exceeded its overall deadline
    DeadlineExceeded,
    /// Response body could not be decoded
    Decode(String),
    /// Any other API error
    Api { status: u16, message: String },
    InvalidUrl(String),
}

impl DevOpsError {
    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transient { .. })
    }
}

impl std::fmt::Display for DevOpsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoToken => write!(
                f,
                "No Azure DevOps token configured (set AZURE_DEVOPS_TOKEN or azure_devops.token)"
            ),
            Self::Unauthorized => write!(f, "Azure DevOps token is invalid or expired"),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::Timeout => write!(f, "Azure DevOps request timed out"),
            Self::Transient { status, message } => match status {
                Some(status) => write!(f, "Azure DevOps unavailable ({}): {}", status, message),
                None => write!(f, "Network error: {}", message),
            },
            Self::DeadlineExceeded => write!(f, "Run deadline exceeded"),
            Self::Decode(message) => write!(f, "Unexpected Azure DevOps response: {}", message),
            Self::Api { status, message } => {
                write!(f, "Azure DevOps API error ({}): {}", status, message)
            }
            Self::InvalidUrl(message) => write!(f, "Invalid collection URL: {}", message),
        }
    }
}

impl std::error::Error for DevOpsError {}

// ============== API Trait ==============

/// Remote hosting operations consumed by the comparator and the reconciler.
pub trait DevOpsApi {
    fn find_repository(&self, name: &str, project: &str) -> Result<GitRepository, DevOpsError>;

    fn list_repositories(&self, project: &str) -> Result<Vec<GitRepository>, DevOpsError>;

    fn list_pull_requests(
        &self,
        repo: &GitRepository,
        query: &PullRequestQuery,
    ) -> Result<Vec<GitPullRequest>, DevOpsError>;

    fn create_pull_request(
        &self,
        repo: &GitRepository,
        payload: &PullRequestPayload,
    ) -> Result<GitPullRequest, DevOpsError>;

    fn set_auto_complete(
        &self,
        repo: &GitRepository,
        pull_request_id: u64,
        set_by: &str,
        merge_strategy: MergeStrategy,
    ) -> Result<(), DevOpsError>;

    /// Commits on `source_ref` missing from `target_ref`, oldest first, with
    /// their linked work item refs.
    fn commits_between(
        &self,
        repo: &GitRepository,
        source_ref: &str,
        target_ref: &str,
    ) -> Result<Vec<CommitRef>, DevOpsError>;

    fn work_items_by_ids(&self, project: &str, ids: &[u64]) -> Result<Vec<WorkItem>, DevOpsError>;

    fn linked_work_items(
        &self,
        repo: &GitRepository,
        pull_request_id: u64,
    ) -> Result<Vec<WorkItem>, DevOpsError>;

    fn pull_request_url(&self, project: &str, repository: &str, pull_request_id: u64) -> String;

    fn work_item_url(&self, project: &str, work_item_id: u64) -> String;

    fn repository_url(&self, project: &str, repository: &str) -> String;

    fn pipeline_url(&self, project: &str, pipeline_id: u32) -> String;
}
