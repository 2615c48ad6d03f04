//! Pull request reconciliation: make sure each changed repository has
//! exactly one pull request from its source to its destination branch,
//! carrying the work items linked to the pending commits.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{
    compare::CompareResult,
    config::ConfigurationError,
    devops::{
        DevOpsApi,
        DevOpsError,
        GitPullRequest,
        GitRepository,
        MergeStrategy,
        PullRequestQuery,
        PullRequestStatus,
        branch_ref,
        strip_branch_ref,
    },
    fleet::{FleetConfig, ResolvedRepository},
    stats,
    work_items::{WorkItem, WorkItemFilter, dedupe_and_filter, extra_ids},
};

/// What to open, one per run.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PullRequestSpec {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub draft: bool,
    /// Identity name, resolved through `identities`.
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub autocomplete: bool,
}

/// One pull request outside the fleet workflow, with its own repository,
/// branches and project.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CustomPullRequest {
    pub repository: String,
    /// Defaults to the fleet's project.
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub source_branch: String,
    #[serde(default)]
    pub destination_branch: String,
    #[serde(flatten)]
    pub pull_request: PullRequestSpec,
}

impl CustomPullRequest {
    pub fn resolve(&self, fleet: &FleetConfig) -> ResolvedRepository {
        ResolvedRepository {
            name: self.repository.clone(),
            path: None,
            source_branch: self.source_branch.clone(),
            destination_branch: self.destination_branch.clone(),
            project: self
                .project
                .clone()
                .filter(|project| !project.is_empty())
                .unwrap_or_else(|| fleet.default_project.clone()),
            pipeline_id: fleet
                .find(&self.repository)
                .and_then(|descriptor| descriptor.pipeline_id),
        }
    }
}

/// Display name to Azure DevOps identity id.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct IdentityMap(HashMap<String, String>);

impl IdentityMap {
    pub fn resolve(&self, name: &str) -> Result<&str, ConfigurationError> {
        self.0
            .get(name)
            .map(|id| id.as_str())
            .ok_or_else(|| ConfigurationError::UnknownIdentity(name.to_string()))
    }
}

impl FromIterator<(String, String)> for IdentityMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItemRef {
    pub id: String,
    pub url: String,
}

/// Request body for creating a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestPayload {
    pub source_ref_name: String,
    pub target_ref_name: String,
    pub title: String,
    pub description: String,
    pub is_draft: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<IdentityRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reviewers: Vec<IdentityRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub work_item_refs: Vec<WorkItemRef>,
}

impl PullRequestPayload {
    /// Resolve every identity `spec` names and assemble the request.
    /// `default_reviewers` apply when `spec.reviewers` is empty.
    pub fn from_spec(
        spec: &PullRequestSpec,
        source_ref: &str,
        target_ref: &str,
        work_items: &[WorkItem],
        identities: &IdentityMap,
        default_reviewers: &[String],
    ) -> Result<Self, ConfigurationError> {
        let created_by = spec
            .author
            .as_deref()
            .map(|name| identities.resolve(name))
            .transpose()?
            .map(|id| IdentityRef { id: id.to_string() });

        if spec.autocomplete && created_by.is_none() {
            return Err(ConfigurationError::Invalid(
                "pull_request.autocomplete requires pull_request.author".to_string(),
            ));
        }

        let reviewer_names: &[String] = if spec.reviewers.is_empty() {
            default_reviewers
        } else {
            &spec.reviewers
        };
        let reviewers = reviewer_names
            .iter()
            .map(|name| {
                identities.resolve(name).map(|id| IdentityRef { id: id.to_string() })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source_ref_name: source_ref.to_string(),
            target_ref_name: target_ref.to_string(),
            title: spec.title.clone(),
            description: spec.description.clone(),
            is_draft: spec.draft,
            created_by,
            reviewers,
            labels: spec
                .tags
                .iter()
                .map(|tag| Label { name: tag.clone() })
                .collect(),
            work_item_refs: work_items
                .iter()
                .map(|item| WorkItemRef {
                    id: item.id.to_string(),
                    url: item.url.clone(),
                })
                .collect(),
        })
    }
}

/// How a repository's pull request was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconcileOutcome {
    ExistingActive,
    ExistingCompleted,
    Created,
    DryRun,
    /// No commits and no completed pull request.
    Empty,
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::ExistingActive => "existing (active)",
            Self::ExistingCompleted => "existing (completed)",
            Self::Created => "created",
            Self::DryRun => "dry run",
            Self::Empty => "nothing to merge",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequestResult {
    /// 0 for dry runs and empty outcomes.
    pub pull_request_id: u64,
    pub repository_name: String,
    pub url: String,
    pub title: String,
    pub is_new: bool,
    pub work_items: Vec<WorkItem>,
    pub outcome: ReconcileOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileFailure {
    pub repository_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub results: Vec<PullRequestResult>,
    pub failures: Vec<ReconcileFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequestSearchResult {
    pub repository_name: String,
    pub pull_request_id: u64,
    pub title: String,
    pub description: String,
    /// Branch names without the `refs/heads/` prefix.
    pub source_branch: String,
    pub destination_branch: String,
    pub status: PullRequestStatus,
    pub is_draft: bool,
    pub url: String,
    pub work_items: Vec<WorkItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItemSearchResult {
    pub repository_name: String,
    pub work_items: Vec<WorkItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub project: String,
    pub url: String,
    /// Set when the repository is part of the fleet and has a pipeline.
    pub pipeline_url: Option<String>,
}

/// Prefer a pull request with the expected title; otherwise accept any
/// with the same source and target refs.
fn pick_pull_request<'p>(
    pull_requests: &'p [GitPullRequest],
    title: &str,
    source_ref: &str,
    target_ref: &str,
) -> Option<&'p GitPullRequest> {
    let candidates: Vec<_> = pull_requests
        .iter()
        .filter(|pr| pr.matches_refs(source_ref, target_ref))
        .collect();
    candidates
        .iter()
        .find(|pr| pr.title == title)
        .or_else(|| candidates.first())
        .copied()
}

fn is_configuration_error(error: &anyhow::Error) -> bool {
    error.downcast_ref::<ConfigurationError>().is_some()
}

/// Runs pull request operations for a fleet against one `DevOpsApi`.
pub struct Reconciler<'a> {
    api: &'a dyn DevOpsApi,
    fleet: &'a FleetConfig,
    filter: &'a WorkItemFilter,
    identities: &'a IdentityMap,
    default_reviewers: &'a [String],
    apply_filter: bool,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        api: &'a dyn DevOpsApi,
        fleet: &'a FleetConfig,
        filter: &'a WorkItemFilter,
        identities: &'a IdentityMap,
        default_reviewers: &'a [String],
    ) -> Self {
        Self {
            api,
            fleet,
            filter,
            identities,
            default_reviewers,
            apply_filter: false,
        }
    }

    /// Narrow attached work items by the configured allowlists.
    pub fn with_filter(mut self, apply_filter: bool) -> Self {
        self.apply_filter = apply_filter;
        self
    }

    fn existing_result(
        &self,
        remote: &GitRepository,
        pr: &GitPullRequest,
        outcome: ReconcileOutcome,
    ) -> Result<PullRequestResult, DevOpsError> {
        let work_items = self.api.linked_work_items(remote, pr.pull_request_id)?;
        Ok(PullRequestResult {
            pull_request_id: pr.pull_request_id,
            repository_name: remote.name.clone(),
            url: self
                .api
                .pull_request_url(&remote.project, &remote.name, pr.pull_request_id),
            title: pr.title.clone(),
            is_new: false,
            work_items,
            outcome,
        })
    }

    fn find_existing(
        &self,
        remote: &GitRepository,
        status: PullRequestStatus,
        spec: &PullRequestSpec,
        source_ref: &str,
        target_ref: &str,
    ) -> Result<Option<GitPullRequest>, DevOpsError> {
        let prs = self.api.list_pull_requests(
            remote,
            &PullRequestQuery::for_refs(status, source_ref, target_ref),
        )?;
        Ok(pick_pull_request(&prs, &spec.title, source_ref, target_ref).cloned())
    }

    /// Fetch each distinct id once, in first-seen order.
    fn fetch_work_items(&self, project: &str, mut ids: Vec<u64>) -> Result<Vec<WorkItem>, DevOpsError> {
        let mut seen = HashSet::new();
        ids.retain(|id| seen.insert(*id));
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.api.work_items_by_ids(project, &ids)
    }

    /// Find or create the pull request for one repository.
    pub fn reconcile(
        &self,
        repo: &ResolvedRepository,
        spec: &PullRequestSpec,
        dry_run: bool,
    ) -> Result<PullRequestResult> {
        repo.validate_remote()?;
        let _scope = stats::enter_repository(&repo.name);
        let remote = self.api.find_repository(&repo.name, &repo.project)?;
        let source_ref = branch_ref(&repo.source_branch);
        let target_ref = branch_ref(&repo.destination_branch);

        if let Some(pr) =
            self.find_existing(&remote, PullRequestStatus::Active, spec, &source_ref, &target_ref)?
        {
            tracing::info!(
                repository = %repo.name,
                pull_request = pr.pull_request_id,
                "Active pull request already exists"
            );
            return Ok(self.existing_result(&remote, &pr, ReconcileOutcome::ExistingActive)?);
        }

        let commits = self.api.commits_between(&remote, &source_ref, &target_ref)?;
        if commits.is_empty() {
            if let Some(pr) = self.find_existing(
                &remote,
                PullRequestStatus::Completed,
                spec,
                &source_ref,
                &target_ref,
            )? {
                tracing::info!(
                    repository = %repo.name,
                    pull_request = pr.pull_request_id,
                    "Branches already merged by a completed pull request"
                );
                return Ok(self.existing_result(&remote, &pr, ReconcileOutcome::ExistingCompleted)?);
            }
            tracing::info!(repository = %repo.name, "No commits to merge");
            return Ok(PullRequestResult {
                pull_request_id: 0,
                repository_name: repo.name.clone(),
                url: String::new(),
                title: spec.title.clone(),
                is_new: false,
                work_items: Vec::new(),
                outcome: ReconcileOutcome::Empty,
            });
        }

        let mut ids: Vec<u64> = commits.iter().flat_map(|commit| commit.work_item_ids()).collect();
        ids.extend(extra_ids(self.filter, &ids));
        let work_items = dedupe_and_filter(
            self.fetch_work_items(&repo.project, ids)?,
            self.filter,
            self.apply_filter,
        );

        let payload = PullRequestPayload::from_spec(
            spec,
            &source_ref,
            &target_ref,
            &work_items,
            self.identities,
            self.default_reviewers,
        )?;

        if dry_run {
            tracing::info!(
                repository = %repo.name,
                work_items = work_items.len(),
                "Dry run: would create pull request"
            );
            return Ok(PullRequestResult {
                pull_request_id: 0,
                repository_name: repo.name.clone(),
                url: String::new(),
                title: payload.title,
                is_new: true,
                work_items,
                outcome: ReconcileOutcome::DryRun,
            });
        }

        let created = match self.api.create_pull_request(&remote, &payload) {
            Ok(created) => created,
            Err(e) if e.is_transient() => {
                // The server may have created it before the response was lost.
                tracing::warn!(
                    repository = %repo.name,
                    "Create failed, checking for the pull request: {}",
                    e
                );
                match self.find_existing(
                    &remote,
                    PullRequestStatus::Active,
                    spec,
                    &source_ref,
                    &target_ref,
                )? {
                    Some(pr) => pr,
                    None => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            repository = %repo.name,
            pull_request = created.pull_request_id,
            "Created pull request"
        );

        if spec.autocomplete
            && let Some(author) = &payload.created_by
        {
            match self.api.set_auto_complete(
                &remote,
                created.pull_request_id,
                &author.id,
                MergeStrategy::NoFastForward,
            ) {
                Ok(()) => {
                    tracing::debug!(pull_request = created.pull_request_id, "Auto-complete set")
                }
                Err(e) => tracing::warn!(
                    repository = %repo.name,
                    pull_request = created.pull_request_id,
                    "Pull request created without auto-complete: {}",
                    e
                ),
            }
        }

        Ok(PullRequestResult {
            pull_request_id: created.pull_request_id,
            repository_name: repo.name.clone(),
            url: self
                .api
                .pull_request_url(&repo.project, &repo.name, created.pull_request_id),
            title: created.title,
            is_new: true,
            work_items,
            outcome: ReconcileOutcome::Created,
        })
    }

    /// Reconcile every repository with pending changes. Remote failures are
    /// collected per repository; configuration errors stop the run.
    pub fn reconcile_all(
        &self,
        compare_results: &[CompareResult],
        spec: &PullRequestSpec,
        dry_run: bool,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for compare_result in compare_results.iter().filter(|r| r.has_changes()) {
            let repo = self.fleet.resolve_by_name(&compare_result.repository_name)?;
            match self.reconcile(&repo, spec, dry_run) {
                Ok(result) => report.results.push(result),
                Err(e) if is_configuration_error(&e) => return Err(e),
                Err(e) => {
                    tracing::warn!(repository = %repo.name, error = %e, "Reconciliation failed");
                    report.failures.push(ReconcileFailure {
                        repository_name: repo.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Find or create the single pull request `custom` describes.
    pub fn create_custom(&self, custom: &CustomPullRequest, dry_run: bool) -> Result<PullRequestResult> {
        let repo = custom.resolve(self.fleet);
        tracing::info!(
            repository = %repo.name,
            "Custom pull request {} -> {}",
            repo.source_branch,
            repo.destination_branch
        );
        self.reconcile(&repo, &custom.pull_request, dry_run)
    }

    fn search_repository(
        &self,
        repo: &ResolvedRepository,
        status: PullRequestStatus,
        max_count: u32,
    ) -> Result<Vec<PullRequestSearchResult>, DevOpsError> {
        let _scope = stats::enter_repository(&repo.name);
        let remote = self.api.find_repository(&repo.name, &repo.project)?;
        let by_source = PullRequestQuery {
            status: Some(status),
            top: Some(max_count),
            source_ref: Some(branch_ref(&repo.source_branch)),
            target_ref: None,
        };
        let by_target = PullRequestQuery {
            status: Some(status),
            top: Some(max_count),
            source_ref: None,
            target_ref: Some(branch_ref(&repo.destination_branch)),
        };

        let mut prs = self.api.list_pull_requests(&remote, &by_source)?;
        prs.extend(self.api.list_pull_requests(&remote, &by_target)?);

        prs.into_iter()
            .map(|pr| -> Result<PullRequestSearchResult, DevOpsError> {
                let work_items = self.api.linked_work_items(&remote, pr.pull_request_id)?;
                Ok(PullRequestSearchResult {
                    repository_name: repo.name.clone(),
                    pull_request_id: pr.pull_request_id,
                    url: self
                        .api
                        .pull_request_url(&repo.project, &repo.name, pr.pull_request_id),
                    description: pr.description.unwrap_or_default(),
                    source_branch: strip_branch_ref(&pr.source_ref_name).to_string(),
                    destination_branch: strip_branch_ref(&pr.target_ref_name).to_string(),
                    status: pr.status,
                    is_draft: pr.is_draft,
                    title: pr.title,
                    work_items,
                })
            })
            .collect()
    }

    /// Pull requests leaving the source branch or entering the destination
    /// branch of each repository, up to `max_count` per query.
    pub fn search_pull_requests(
        &self,
        status: PullRequestStatus,
        max_count: u32,
    ) -> Result<Vec<PullRequestSearchResult>> {
        let mut results = Vec::new();
        for repo in self.fleet.resolve_all() {
            if let Err(e) = repo.validate_remote() {
                tracing::warn!(repository = %repo.name, "Skipping: {}", e);
                continue;
            }
            match self.search_repository(&repo, status, max_count) {
                Ok(found) => results.extend(found),
                Err(DevOpsError::NotFound(message)) => {
                    tracing::warn!(repository = %repo.name, "Skipping: not found: {}", message);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(repository = %repo.name, "Skipping: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(results)
    }

    fn repository_work_items(
        &self,
        repo: &ResolvedRepository,
        apply_filter: bool,
    ) -> Result<Vec<WorkItem>, DevOpsError> {
        let _scope = stats::enter_repository(&repo.name);
        let remote = self.api.find_repository(&repo.name, &repo.project)?;
        let commits = self.api.commits_between(
            &remote,
            &branch_ref(&repo.source_branch),
            &branch_ref(&repo.destination_branch),
        )?;
        let ids = commits.iter().flat_map(|commit| commit.work_item_ids()).collect();
        Ok(dedupe_and_filter(
            self.fetch_work_items(&repo.project, ids)?,
            self.filter,
            apply_filter,
        ))
    }

    /// Work items linked to the pending commits of each changed repository.
    pub fn search_work_items(
        &self,
        compare_results: &[CompareResult],
        apply_filter: bool,
    ) -> Result<Vec<WorkItemSearchResult>> {
        let mut results = Vec::new();
        for compare_result in compare_results.iter().filter(|r| r.has_changes()) {
            let repo = self.fleet.resolve_by_name(&compare_result.repository_name)?;
            repo.validate_remote()?;
            match self.repository_work_items(&repo, apply_filter) {
                Ok(work_items) => results.push(WorkItemSearchResult {
                    repository_name: repo.name.clone(),
                    work_items,
                }),
                Err(e) if e.is_transient() || matches!(e, DevOpsError::NotFound(_)) => {
                    tracing::warn!(repository = %repo.name, "Skipping: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(results)
    }

    /// Repositories of a team project, with pipeline links for fleet members.
    pub fn list_repositories(&self, project: &str) -> Result<Vec<RepositoryInfo>> {
        let mut repositories: Vec<RepositoryInfo> = self
            .api
            .list_repositories(project)?
            .into_iter()
            .map(|repo| {
                let pipeline_url = self
                    .fleet
                    .find(&repo.name)
                    .and_then(|descriptor| descriptor.pipeline_id)
                    .map(|id| self.api.pipeline_url(project, id));
                RepositoryInfo {
                    url: self.api.repository_url(project, &repo.name),
                    project: project.to_string(),
                    name: repo.name,
                    pipeline_url,
                }
            })
            .collect();
        repositories.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(repositories)
    }
}
