//! libgit2-backed branch comparison for local clones.
//!
//! Each comparison opens its own `Repository` handle and drops it before
//! returning, so no handle outlives a single call.

use std::{path::Path, time::Instant};

use anyhow::{Context, Result};
use git2::{BranchType, Oid, Repository, Sort};

use crate::{
    differ::{BranchComparison, BranchDiffer},
    fleet::ResolvedRepository,
    stats::record_call,
};

pub const DEFAULT_REMOTE: &str = "origin";

/// Compares remote-tracking branches in local clones.
#[derive(Debug, Clone)]
pub struct LocalDiffer {
    remote: String,
}

impl Default for LocalDiffer {
    fn default() -> Self {
        Self {
            remote: DEFAULT_REMOTE.to_string(),
        }
    }
}

impl BranchDiffer for LocalDiffer {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn ref_name(&self, branch: &str) -> String {
        format!("{}/{}", self.remote, branch)
    }

    fn precheck(&self, repo: &ResolvedRepository) -> Result<(), String> {
        match &repo.path {
            None => Err("no local path configured".to_string()),
            Some(path) if !Path::new(path).is_dir() => {
                Err(format!("local path '{}' does not exist", path))
            }
            Some(_) => Ok(()),
        }
    }

    fn compare_branches(
        &self,
        repo: &ResolvedRepository,
        source_ref: &str,
        destination_ref: &str,
    ) -> Result<BranchComparison> {
        let path = repo.path.as_deref().unwrap_or_default();
        compare_branches(Path::new(path), source_ref, destination_ref)
    }
}

/// Resolve a branch name, trying remote-tracking branches before local ones.
fn find_branch_tip(repo: &Repository, name: &str) -> Option<Oid> {
    repo.find_branch(name, BranchType::Remote)
        .or_else(|_| repo.find_branch(name, BranchType::Local))
        .ok()
        .and_then(|branch| branch.get().target())
}

/// Commits reachable from `source` but not from `destination`, oldest first.
/// Equivalent to `git rev-list --reverse <destination>..<source>`.
pub fn compare_branches(path: &Path, source: &str, destination: &str) -> Result<BranchComparison> {
    let start = Instant::now();
    let result = compare_branches_inner(path, source, destination);
    record_call("git2:compare", start.elapsed(), result.is_ok());
    result
}

fn compare_branches_inner(path: &Path, source: &str, destination: &str) -> Result<BranchComparison> {
    let repo = Repository::open(path)
        .with_context(|| format!("Failed to open repository at {}", path.display()))?;

    let (Some(source_tip), Some(destination_tip)) = (
        find_branch_tip(&repo, source),
        find_branch_tip(&repo, destination),
    ) else {
        tracing::warn!(
            "Branches can't be compared because one or both do not exist: '{}' -> '{}' in {}",
            source,
            destination,
            path.display()
        );
        return Ok(BranchComparison::absent());
    };

    let mut walk = repo.revwalk()?;
    walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME | Sort::REVERSE)?;
    walk.push(source_tip)?;
    walk.hide(destination_tip)?;

    let commits = walk
        .map(|oid| oid.map(|oid| oid.to_string()))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to walk commits {}..{}", destination, source))?;

    Ok(BranchComparison::from_commits(commits))
}
