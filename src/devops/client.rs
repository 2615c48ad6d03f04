use std::{
    thread,
    time::{Duration, Instant},
};

use base64::{Engine, engine::general_purpose::STANDARD as B64};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use url::Url;

use super::{
    CommitRef,
    DevOpsApi,
    DevOpsError,
    GitPullRequest,
    GitRepository,
    MergeStrategy,
    PullRequestQuery,
    RawWorkItem,
    ResourceRef,
    strip_branch_ref,
};
use crate::{
    config::{AppConfig, AzureDevOpsConfig},
    pull_request::PullRequestPayload,
    stats::record_call,
    work_items::WorkItem,
};

const API_VERSION: &str = "7.1";
const PAGE_SIZE: usize = 100;
/// Upper bound of ids per workitemsbatch request.
const WORK_ITEM_BATCH_SIZE: usize = 200;
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

const WORK_ITEM_FIELDS: [&str; 6] = [
    "System.Id",
    "System.Title",
    "System.WorkItemType",
    "System.AreaPath",
    "System.IterationPath",
    "System.State",
];

/// `{ "count": n, "value": [...] }` envelope used by list endpoints.
#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    value: Vec<T>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VersionDescriptor<'a> {
    version: &'a str,
    version_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitsBatchRequest<'a> {
    item_version: VersionDescriptor<'a>,
    compare_version: VersionDescriptor<'a>,
    include_work_items: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkItemsBatchRequest<'a> {
    ids: &'a [u64],
    fields: &'a [&'a str],
    error_policy: &'static str,
}

#[derive(Debug, Serialize)]
struct IdentityRef<'a> {
    id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletionOptions {
    merge_strategy: MergeStrategy,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AutoCompleteRequest<'a> {
    auto_complete_set_by: IdentityRef<'a>,
    completion_options: CompletionOptions,
}

/// Blocking Azure DevOps client. One instance is shared for a whole run.
pub struct DevOpsClient {
    collection_url: Url,
    auth_header: String,
    agent: ureq::Agent,
    deadline: Instant,
}

impl DevOpsClient {
    pub fn new(config: &AzureDevOpsConfig, token: Option<String>) -> Result<Self, DevOpsError> {
        let token = token.ok_or(DevOpsError::NoToken)?;
        let collection_url = Url::parse(config.collection_url.trim_end_matches('/'))
            .map_err(|e| DevOpsError::InvalidUrl(format!("{}: {}", config.collection_url, e)))?;
        if collection_url.cannot_be_a_base() {
            return Err(DevOpsError::InvalidUrl(config.collection_url.clone()));
        }

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_secs())))
            .build()
            .into();

        Ok(Self {
            collection_url,
            auth_header: format!("Basic {}", B64.encode(format!(":{}", token))),
            agent,
            deadline: Instant::now() + Duration::from_secs(config.deadline_secs()),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, DevOpsError> {
        Self::new(&config.azure_devops, config.token())
    }

    /// `{collection}/{segments...}?{query}&api-version=...`
    fn api_url(&self, segments: &[&str], query: &[(&str, String)]) -> String {
        let mut url = build_url(&self.collection_url, segments);
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            pairs.append_pair("api-version", API_VERSION);
        }
        url.to_string()
    }

    fn check_deadline(&self) -> Result<(), DevOpsError> {
        if Instant::now() >= self.deadline {
            return Err(DevOpsError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Run `attempt` until it succeeds, fails permanently, or retries run out.
    fn with_retry<T>(
        &self,
        call: &str,
        attempt: impl FnMut() -> Result<T, DevOpsError>,
    ) -> Result<T, DevOpsError> {
        self.with_attempts(call, MAX_ATTEMPTS, attempt)
    }

    fn with_attempts<T>(
        &self,
        call: &str,
        max_attempts: u32,
        mut attempt: impl FnMut() -> Result<T, DevOpsError>,
    ) -> Result<T, DevOpsError> {
        let mut tries = 0;
        loop {
            self.check_deadline()?;
            tries += 1;
            let start = Instant::now();
            let result = attempt();
            record_call(call, start.elapsed(), result.is_ok());
            match result {
                Err(e) if e.is_transient() && tries < max_attempts => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(tries - 1);
                    tracing::warn!(call, attempt = tries, ?delay, "Retrying after error: {}", e);
                    thread::sleep(delay);
                }
                other => return other,
            }
        }
    }

    fn get_json<T: DeserializeOwned>(&self, call: &str, url: &str) -> Result<T, DevOpsError> {
        tracing::debug!("GET {}", url);
        self.with_retry(call, || {
            let mut response = self
                .agent
                .get(url)
                .header("Authorization", &self.auth_header)
                .header("Accept", "application/json")
                .header("User-Agent", "fleet-pr")
                .call()
                .map_err(|e| classify_error(e, url))?;
            response
                .body_mut()
                .read_json()
                .map_err(|e| DevOpsError::Decode(e.to_string()))
        })
    }

    /// POST for queries that are safe to repeat.
    fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        call: &str,
        url: &str,
        body: &B,
    ) -> Result<T, DevOpsError> {
        self.post_json_attempts(call, url, body, MAX_ATTEMPTS)
    }

    /// POST that creates something; a lost response must not cause a
    /// second create.
    fn post_json_once<B: Serialize, T: DeserializeOwned>(
        &self,
        call: &str,
        url: &str,
        body: &B,
    ) -> Result<T, DevOpsError> {
        self.post_json_attempts(call, url, body, 1)
    }

    fn post_json_attempts<B: Serialize, T: DeserializeOwned>(
        &self,
        call: &str,
        url: &str,
        body: &B,
        max_attempts: u32,
    ) -> Result<T, DevOpsError> {
        tracing::debug!("POST {}", url);
        self.with_attempts(call, max_attempts, || {
            let mut response = self
                .agent
                .post(url)
                .header("Authorization", &self.auth_header)
                .header("Accept", "application/json")
                .header("User-Agent", "fleet-pr")
                .send_json(body)
                .map_err(|e| classify_error(e, url))?;
            response
                .body_mut()
                .read_json()
                .map_err(|e| DevOpsError::Decode(e.to_string()))
        })
    }

    fn patch_json<B: Serialize>(&self, call: &str, url: &str, body: &B) -> Result<(), DevOpsError> {
        tracing::debug!("PATCH {}", url);
        self.with_retry(call, || {
            self.agent
                .patch(url)
                .header("Authorization", &self.auth_header)
                .header("Accept", "application/json")
                .header("User-Agent", "fleet-pr")
                .send_json(body)
                .map_err(|e| classify_error(e, url))?;
            Ok(())
        })
    }

    fn repository_api_url(
        &self,
        repo: &GitRepository,
        tail: &[&str],
        query: &[(&str, String)],
    ) -> String {
        let mut segments = vec![
            repo.project.as_str(),
            "_apis",
            "git",
            "repositories",
            repo.id.as_str(),
        ];
        segments.extend_from_slice(tail);
        self.api_url(&segments, query)
    }
}

fn build_url(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty();
        path.extend(segments);
    }
    url
}

fn classify_error(error: ureq::Error, url: &str) -> DevOpsError {
    match error {
        ureq::Error::StatusCode(401) | ureq::Error::StatusCode(403) => DevOpsError::Unauthorized,
        ureq::Error::StatusCode(404) => DevOpsError::NotFound(url.to_string()),
        ureq::Error::StatusCode(status) if status == 429 || status >= 500 => {
            DevOpsError::Transient {
                status: Some(status),
                message: url.to_string(),
            }
        }
        ureq::Error::StatusCode(status) => DevOpsError::Api {
            status,
            message: url.to_string(),
        },
        ureq::Error::Timeout(_) => DevOpsError::Timeout,
        ureq::Error::Io(e) => DevOpsError::Transient {
            status: None,
            message: e.to_string(),
        },
        ureq::Error::ConnectionFailed | ureq::Error::HostNotFound => DevOpsError::Transient {
            status: None,
            message: format!("{} ({})", error, url),
        },
        other => DevOpsError::Api {
            status: 0,
            message: other.to_string(),
        },
    }
}

impl DevOpsApi for DevOpsClient {
    fn find_repository(&self, name: &str, project: &str) -> Result<GitRepository, DevOpsError> {
        let url = self.api_url(&[project, "_apis", "git", "repositories", name], &[]);
        let mut repo: GitRepository = self.get_json("api:repository", &url)?;
        repo.project = project.to_string();
        Ok(repo)
    }

    fn list_repositories(&self, project: &str) -> Result<Vec<GitRepository>, DevOpsError> {
        let url = self.api_url(&[project, "_apis", "git", "repositories"], &[]);
        let response: ListResponse<GitRepository> = self.get_json("api:repositories", &url)?;
        Ok(response
            .value
            .into_iter()
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
        let mut criteria = Vec::new();
        if let Some(status) = query.status {
            criteria.push(("searchCriteria.status", status.as_query().to_string()));
        }
        if let Some(source_ref) = &query.source_ref {
            criteria.push(("searchCriteria.sourceRefName", source_ref.clone()));
        }
        if let Some(target_ref) = &query.target_ref {
            criteria.push(("searchCriteria.targetRefName", target_ref.clone()));
        }

        if let Some(top) = query.top {
            let mut params = criteria;
            params.push(("$top", top.to_string()));
            let url = self.repository_api_url(repo, &["pullrequests"], &params);
            let response: ListResponse<GitPullRequest> =
                self.get_json("api:pullrequests", &url)?;
            return Ok(response.value);
        }

        let mut all_prs = Vec::new();
        let mut skip = 0;
        loop {
            let mut params = criteria.clone();
            params.push(("$top", PAGE_SIZE.to_string()));
            params.push(("$skip", skip.to_string()));
            let url = self.repository_api_url(repo, &["pullrequests"], &params);
            let response: ListResponse<GitPullRequest> =
                self.get_json("api:pullrequests", &url)?;

            let count = response.value.len();
            all_prs.extend(response.value);

            // If we got fewer than a page of results, we've reached the end
            if count < PAGE_SIZE {
                break;
            }
            skip += PAGE_SIZE;
        }
        Ok(all_prs)
    }

    fn create_pull_request(
        &self,
        repo: &GitRepository,
        payload: &PullRequestPayload,
    ) -> Result<GitPullRequest, DevOpsError> {
        let url = self.repository_api_url(repo, &["pullrequests"], &[]);
        self.post_json_once("api:create-pullrequest", &url, payload)
    }

    fn set_auto_complete(
        &self,
        repo: &GitRepository,
        pull_request_id: u64,
        set_by: &str,
        merge_strategy: MergeStrategy,
    ) -> Result<(), DevOpsError> {
        let id = pull_request_id.to_string();
        let url = self.repository_api_url(repo, &["pullrequests", id.as_str()], &[]);
        self.patch_json(
            "api:update-pullrequest",
            &url,
            &AutoCompleteRequest {
                auto_complete_set_by: IdentityRef { id: set_by },
                completion_options: CompletionOptions { merge_strategy },
            },
        )
    }

    fn commits_between(
        &self,
        repo: &GitRepository,
        source_ref: &str,
        target_ref: &str,
    ) -> Result<Vec<CommitRef>, DevOpsError> {
        let request = CommitsBatchRequest {
            item_version: VersionDescriptor {
                version: strip_branch_ref(target_ref),
                version_type: "branch",
            },
            compare_version: VersionDescriptor {
                version: strip_branch_ref(source_ref),
                version_type: "branch",
            },
            include_work_items: true,
        };

        let mut commits = Vec::new();
        let mut skip = 0;
        loop {
            let url = self.repository_api_url(
                repo,
                &["commitsbatch"],
                &[("$top", PAGE_SIZE.to_string()), ("$skip", skip.to_string())],
            );
            let response: ListResponse<CommitRef> =
                self.post_json("api:commitsbatch", &url, &request)?;
            let count = response.value.len();
            commits.extend(response.value);
            if count < PAGE_SIZE {
                break;
            }
            skip += PAGE_SIZE;
        }

        // The API lists newest first.
        commits.reverse();
        Ok(commits)
    }

    fn work_items_by_ids(&self, project: &str, ids: &[u64]) -> Result<Vec<WorkItem>, DevOpsError> {
        let url = self.api_url(&[project, "_apis", "wit", "workitemsbatch"], &[]);
        let mut work_items = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(WORK_ITEM_BATCH_SIZE) {
            let response: ListResponse<Option<RawWorkItem>> = self.post_json(
                "api:workitemsbatch",
                &url,
                &WorkItemsBatchRequest {
                    ids: chunk,
                    fields: &WORK_ITEM_FIELDS,
                    error_policy: "omit",
                },
            )?;
            work_items.extend(response.value.into_iter().flatten().map(|raw| {
                let url = self.work_item_url(project, raw.id);
                raw.into_work_item(url)
            }));
        }
        Ok(work_items)
    }

    fn linked_work_items(
        &self,
        repo: &GitRepository,
        pull_request_id: u64,
    ) -> Result<Vec<WorkItem>, DevOpsError> {
        let id = pull_request_id.to_string();
        let url = self.repository_api_url(repo, &["pullRequests", id.as_str(), "workitems"], &[]);
        let response: ListResponse<ResourceRef> = self.get_json("api:pullrequest-workitems", &url)?;
        let ids: Vec<u64> = response
            .value
            .iter()
            .filter_map(|work_item| work_item.id.parse().ok())
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.work_items_by_ids(&repo.project, &ids)
    }

    fn pull_request_url(&self, project: &str, repository: &str, pull_request_id: u64) -> String {
        let id = pull_request_id.to_string();
        build_url(
            &self.collection_url,
            &[project, "_git", repository, "pullrequest", id.as_str()],
        )
        .to_string()
    }

    fn work_item_url(&self, project: &str, work_item_id: u64) -> String {
        let id = work_item_id.to_string();
        build_url(&self.collection_url, &[project, "_workitems", "edit", id.as_str()]).to_string()
    }

    fn repository_url(&self, project: &str, repository: &str) -> String {
        build_url(&self.collection_url, &[project, "_git", repository]).to_string()
    }

    fn pipeline_url(&self, project: &str, pipeline_id: u32) -> String {
        let mut url = build_url(&self.collection_url, &[project, "_build"]);
        url.query_pairs_mut()
            .append_pair("definitionId", &pipeline_id.to_string());
        url.to_string()
    }
}
