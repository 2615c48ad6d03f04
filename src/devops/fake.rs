//! In-memory `DevOpsApi` for tests.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap, HashSet},
};

use super::{
    CommitRef,
    DevOpsApi,
    DevOpsError,
    GitPullRequest,
    GitRepository,
    MergeStrategy,
    PullRequestQuery,
    PullRequestStatus,
    ResourceRef,
};
use crate::{
    pull_request::PullRequestPayload,
    work_items::{WorkItem, work_item},
};

const COLLECTION: &str = "https://dev.azure.com/acme";

#[derive(Default)]
struct FakeState {
    repositories: BTreeMap<String, GitRepository>,
    commits: HashMap<String, Vec<CommitRef>>,
    missing_branches: HashSet<String>,
    failing: HashSet<String>,
    lost_create_responses: HashSet<String>,
    failing_auto_complete: HashSet<String>,
    work_items: HashMap<u64, WorkItem>,
    pull_requests: HashMap<String, Vec<GitPullRequest>>,
    pull_request_links: HashMap<u64, Vec<u64>>,
    next_pull_request_id: u64,
    create_calls: usize,
    auto_complete_calls: Vec<(u64, String)>,
}

#[derive(Default)]
pub struct FakeDevOps {
    state: RefCell<FakeState>,
}

impl FakeDevOps {
    pub fn add_repository(&self, name: &str) {
        self.state.borrow_mut().repositories.insert(
            name.to_string(),
            GitRepository {
                id: format!("{name}-id"),
                name: name.to_string(),
                project: String::new(),
            },
        );
    }

    /// Commits between the fleet branches, oldest first, each with its
    /// linked work item ids. Unknown ids are registered as Tasks.
    pub fn set_commits(&self, repository: &str, commits: &[(&str, &[u64])]) {
        let mut state = self.state.borrow_mut();
        let mut refs = Vec::new();
        for (commit_id, work_item_ids) in commits {
            for id in *work_item_ids {
                state
                    .work_items
                    .entry(*id)
                    .or_insert_with(|| work_item(*id, "Task"));
            }
            refs.push(CommitRef {
                commit_id: commit_id.to_string(),
                work_items: work_item_ids
                    .iter()
                    .map(|id| ResourceRef { id: id.to_string() })
                    .collect(),
            });
        }
        state.commits.insert(repository.to_string(), refs);
    }

    pub fn set_missing_branches(&self, repository: &str) {
        self.state
            .borrow_mut()
            .missing_branches
            .insert(repository.to_string());
    }

    /// Every call touching `repository` fails with a transient error.
    pub fn fail_repository(&self, repository: &str) {
        self.state.borrow_mut().failing.insert(repository.to_string());
    }

    /// Creates in `repository` store the pull request, then report a
    /// transient error as if the response never arrived.
    pub fn lose_create_responses(&self, repository: &str) {
        self.state
            .borrow_mut()
            .lost_create_responses
            .insert(repository.to_string());
    }

    pub fn fail_auto_complete(&self, repository: &str) {
        self.state
            .borrow_mut()
            .failing_auto_complete
            .insert(repository.to_string());
    }

    pub fn add_work_item(&self, item: WorkItem) {
        self.state.borrow_mut().work_items.insert(item.id, item);
    }

    pub fn add_pull_request(
        &self,
        repository: &str,
        id: u64,
        title: &str,
        status: PullRequestStatus,
        source_ref: &str,
        target_ref: &str,
    ) {
        let mut state = self.state.borrow_mut();
        state.next_pull_request_id = state.next_pull_request_id.max(id);
        state
            .pull_requests
            .entry(repository.to_string())
            .or_default()
            .push(GitPullRequest {
                pull_request_id: id,
                title: title.to_string(),
                description: None,
                source_ref_name: source_ref.to_string(),
                target_ref_name: target_ref.to_string(),
                status,
                is_draft: false,
            });
    }

    pub fn link_work_items(&self, pull_request_id: u64, ids: &[u64]) {
        let mut state = self.state.borrow_mut();
        for id in ids {
            state
                .work_items
                .entry(*id)
                .or_insert_with(|| work_item(*id, "Task"));
        }
        state
            .pull_request_links
            .insert(pull_request_id, ids.to_vec());
    }

    pub fn create_calls(&self) -> usize {
        self.state.borrow().create_calls
    }

    pub fn auto_complete_calls(&self) -> Vec<(u64, String)> {
        self.state.borrow().auto_complete_calls.clone()
    }

    pub fn pull_requests(&self, repository: &str) -> Vec<GitPullRequest> {
        self.state
            .borrow()
            .pull_requests
            .get(repository)
            .cloned()
            .unwrap_or_default()
    }

    fn check(&self, repository: &str) -> Result<(), DevOpsError> {
        if self.state.borrow().failing.contains(repository) {
            return Err(DevOpsError::Transient {
                status: Some(503),
                message: format!("{repository} unavailable"),
            });
        }
        Ok(())
    }
}

impl DevOpsApi for FakeDevOps {
    fn find_repository(&self, name: &str, project: &str) -> Result<GitRepository, DevOpsError> {
        self.check(name)?;
        let mut repo = self
            .state
            .borrow()
            .repositories
            .get(name)
            .cloned()
            .ok_or_else(|| DevOpsError::NotFound(format!("repository {name}")))?;
        repo.project = project.to_string();
        Ok(repo)
    }

    fn list_repositories(&self, project: &str) -> Result<Vec<GitRepository>, DevOpsError> {
        Ok(self
            .state
            .borrow()
            .repositories
            .values()
            .cloned()
            .map(|mut repo| {
                repo.project = project.to_string();
                repo
            })
            .collect())
    }

    fn list_pull_requests(
        &self,
        repo: &GitRepository,
        query: &PullRequestQuery,
    ) -> Result<Vec<GitPullRequest>, DevOpsError> {
        self.check(&repo.name)?;
        let state = self.state.borrow();
        let prs = state
            .pull_requests
            .get(&repo.name)
            .map(|prs| prs.as_slice())
            .unwrap_or_default();
        let matching = prs.iter().filter(|pr| {
            query
                .status
                .is_none_or(|status| status == PullRequestStatus::All || status == pr.status)
                && query
                    .source_ref
                    .as_ref()
                    .is_none_or(|source_ref| *source_ref == pr.source_ref_name)
                && query
                    .target_ref
                    .as_ref()
                    .is_none_or(|target_ref| *target_ref == pr.target_ref_name)
        });
        let limit = query.top.map(|top| top as usize).unwrap_or(usize::MAX);
        Ok(matching.take(limit).cloned().collect())
    }

    fn create_pull_request(
        &self,
        repo: &GitRepository,
        payload: &PullRequestPayload,
    ) -> Result<GitPullRequest, DevOpsError> {
        self.check(&repo.name)?;
        let mut state = self.state.borrow_mut();
        state.create_calls += 1;
        state.next_pull_request_id += 1;
        let id = state.next_pull_request_id;
        let pr = GitPullRequest {
            pull_request_id: id,
            title: payload.title.clone(),
            description: Some(payload.description.clone()),
            source_ref_name: payload.source_ref_name.clone(),
            target_ref_name: payload.target_ref_name.clone(),
            status: PullRequestStatus::Active,
            is_draft: payload.is_draft,
        };
        let linked = payload
            .work_item_refs
            .iter()
            .filter_map(|work_item| work_item.id.parse().ok())
            .collect();
        state.pull_request_links.insert(id, linked);
        state
            .pull_requests
            .entry(repo.name.clone())
            .or_default()
            .push(pr.clone());
        if state.lost_create_responses.contains(&repo.name) {
            return Err(DevOpsError::Timeout);
        }
        Ok(pr)
    }

    fn set_auto_complete(
        &self,
        repo: &GitRepository,
        pull_request_id: u64,
        set_by: &str,
        _merge_strategy: MergeStrategy,
    ) -> Result<(), DevOpsError> {
        self.check(&repo.name)?;
        if self.state.borrow().failing_auto_complete.contains(&repo.name) {
            return Err(DevOpsError::Api {
                status: 400,
                message: format!("auto-complete rejected for {pull_request_id}"),
            });
        }
        self.state
            .borrow_mut()
            .auto_complete_calls
            .push((pull_request_id, set_by.to_string()));
        Ok(())
    }

    fn commits_between(
        &self,
        repo: &GitRepository,
        _source_ref: &str,
        _target_ref: &str,
    ) -> Result<Vec<CommitRef>, DevOpsError> {
        self.check(&repo.name)?;
        let state = self.state.borrow();
        if state.missing_branches.contains(&repo.name) {
            return Err(DevOpsError::NotFound(format!("branches of {}", repo.name)));
        }
        Ok(state.commits.get(&repo.name).cloned().unwrap_or_default())
    }

    fn work_items_by_ids(&self, _project: &str, ids: &[u64]) -> Result<Vec<WorkItem>, DevOpsError> {
        let state = self.state.borrow();
        Ok(ids
            .iter()
            .filter_map(|id| state.work_items.get(id).cloned())
            .collect())
    }

    fn linked_work_items(
        &self,
        repo: &GitRepository,
        pull_request_id: u64,
    ) -> Result<Vec<WorkItem>, DevOpsError> {
        let ids = self
            .state
            .borrow()
            .pull_request_links
            .get(&pull_request_id)
            .cloned()
            .unwrap_or_default();
        self.work_items_by_ids(&repo.project, &ids)
    }

    fn pull_request_url(&self, project: &str, repository: &str, pull_request_id: u64) -> String {
        format!("{COLLECTION}/{project}/_git/{repository}/pullrequest/{pull_request_id}")
    }

    fn work_item_url(&self, project: &str, work_item_id: u64) -> String {
        format!("{COLLECTION}/{project}/_workitems/edit/{work_item_id}")
    }

    fn repository_url(&self, project: &str, repository: &str) -> String {
        format!("{COLLECTION}/{project}/_git/{repository}")
    }

    fn pipeline_url(&self, project: &str, pipeline_id: u32) -> String {
        format!("{COLLECTION}/{project}/_build?definitionId={pipeline_id}")
    }
}
