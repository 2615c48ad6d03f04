//! Branch comparison abstraction shared by the local (libgit2) and remote
//! (Azure DevOps) comparison paths.

use anyhow::Result;

use crate::{
    devops::{DevOpsApi, DevOpsError, branch_ref},
    fleet::ResolvedRepository,
};

/// Outcome of comparing a source ref against a destination ref.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchComparison {
    pub changed: bool,
    /// Number of commits on source that destination lacks.
    pub count: usize,
    /// Commit ids, oldest first.
    pub commits: Vec<String>,
}

impl BranchComparison {
    pub fn from_commits(commits: Vec<String>) -> Self {
        Self {
            changed: !commits.is_empty(),
            count: commits.len(),
            commits,
        }
    }

    /// One side of the comparison does not exist.
    pub fn absent() -> Self {
        Self::default()
    }
}

pub trait BranchDiffer {
    /// Short label for logs ("local", "remote").
    fn kind(&self) -> &'static str;

    /// Fully-qualified ref for `branch` in this differ's naming scheme.
    fn ref_name(&self, branch: &str) -> String;

    /// Whether the repository can be compared at all; repositories that
    /// cannot are skipped with a warning.
    fn precheck(&self, _repo: &ResolvedRepository) -> Result<(), String> {
        Ok(())
    }

    /// Compare two refs produced by [`BranchDiffer::ref_name`]. An absent
    /// ref yields [`BranchComparison::absent`], not an error.
    fn compare_branches(
        &self,
        repo: &ResolvedRepository,
        source_ref: &str,
        destination_ref: &str,
    ) -> Result<BranchComparison>;
}

/// Compares branches through the hosted API's commit batch query.
pub struct RemoteDiffer<'a> {
    api: &'a dyn DevOpsApi,
}

impl<'a> RemoteDiffer<'a> {
    pub fn new(api: &'a dyn DevOpsApi) -> Self {
        Self { api }
    }
}

impl BranchDiffer for RemoteDiffer<'_> {
    fn kind(&self) -> &'static str {
        "remote"
    }

    fn ref_name(&self, branch: &str) -> String {
        branch_ref(branch)
    }

    fn precheck(&self, repo: &ResolvedRepository) -> Result<(), String> {
        repo.validate_remote().map_err(|e| e.to_string())
    }

    fn compare_branches(
        &self,
        repo: &ResolvedRepository,
        source_ref: &str,
        destination_ref: &str,
    ) -> Result<BranchComparison> {
        let remote_repo = match self.api.find_repository(&repo.name, &repo.project) {
            Ok(remote_repo) => remote_repo,
            Err(DevOpsError::NotFound(message)) => {
                tracing::warn!(repository = %repo.name, "Repository not found remotely: {}", message);
                return Ok(BranchComparison::absent());
            }
            Err(e) => return Err(e.into()),
        };
        match self
            .api
            .commits_between(&remote_repo, source_ref, destination_ref)
        {
            Ok(commits) => Ok(BranchComparison::from_commits(
                commits.into_iter().map(|commit| commit.commit_id).collect(),
            )),
            Err(DevOpsError::NotFound(message)) => {
                tracing::warn!(
                    repository = %repo.name,
                    "Branches can't be compared because one or both do not exist: {}",
                    message
                );
                Ok(BranchComparison::absent())
            }
            Err(e) => Err(e.into()),
        }
    }
}
