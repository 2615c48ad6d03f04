use super::{ContentGenerator, group_by_repository, split_by_changes, unique_work_items};
use crate::{
    compare::CompareResult,
    pull_request::{
        PullRequestResult,
        PullRequestSearchResult,
        ReconcileFailure,
        RepositoryInfo,
        WorkItemSearchResult,
    },
    work_items::WorkItem,
};

pub struct MarkdownGenerator;

fn work_item_link(item: &WorkItem) -> String {
    format!("* Work Item Id: [{}]({})", item.id, item.url)
}

fn or_dash(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("-")
}

impl ContentGenerator for MarkdownGenerator {
    fn compare_results(&self, repository_count: usize, results: &[CompareResult]) -> Vec<String> {
        let (unchanged, changed) = split_by_changes(results);
        let mut lines = vec![format!("**Repositories count: {}**", repository_count), String::new()];

        lines.push(format!("**Repositories without changes ({}):**", unchanged.len()));
        for (index, result) in unchanged.iter().enumerate() {
            lines.push(format!(
                "{}. Repository: *'{}'*. No changes between **'{}'** and **'{}'**",
                index + 1,
                result.repository_name,
                result.source_branch,
                result.destination_branch
            ));
        }
        lines.push(String::new());

        lines.push(format!("**Repositories with changes ({}):**", changed.len()));
        for (index, result) in changed.iter().enumerate() {
            lines.push(format!(
                "{}. Repository: *'{}'*. There are changes between **'{}'** and **'{}'**. Commits count: {}.",
                index + 1,
                result.repository_name,
                result.source_branch,
                result.destination_branch,
                result.changes_count
            ));
        }
        lines.push(String::new());
        lines
    }

    fn pull_request_results(
        &self,
        results: &[PullRequestResult],
        failures: &[ReconcileFailure],
    ) -> Vec<String> {
        let mut lines = Vec::new();
        for (index, result) in results.iter().enumerate() {
            lines.push(format!("**{}: {}:**", index + 1, result.repository_name));
            if result.pull_request_id == 0 {
                lines.push(format!(
                    "No pull request ({}). Work items count: {}.",
                    result.outcome,
                    result.work_items.len()
                ));
            } else {
                lines.push(format!(
                    "Pull request [{}]({}) ({}). Work items count: {}.",
                    result.pull_request_id,
                    result.url,
                    result.outcome,
                    result.work_items.len()
                ));
            }
            lines.push("Work items:".to_string());
            lines.extend(result.work_items.iter().map(work_item_link));
            lines.push(String::new());
        }

        if !failures.is_empty() {
            lines.push(format!("**Failed repositories ({}):**", failures.len()));
            lines.extend(
                failures
                    .iter()
                    .map(|failure| format!("* *'{}'*: {}", failure.repository_name, failure.error)),
            );
            lines.push(String::new());
        }

        if results.iter().any(|result| result.pull_request_id != 0) {
            lines.extend(self.pull_requests_summary(results));
            lines.push(String::new());
        }
        lines.extend(self.work_items_summary(results));
        lines
    }

    fn pull_requests_summary(&self, results: &[PullRequestResult]) -> Vec<String> {
        let mut lines = vec!["**Pull Requests summary:**".to_string()];
        lines.extend(
            results
                .iter()
                .filter(|result| result.pull_request_id != 0)
                .map(|result| format!("* PullRequestId: [{}]({})", result.pull_request_id, result.url)),
        );
        lines
    }

    fn work_items_summary(&self, results: &[PullRequestResult]) -> Vec<String> {
        let work_items = unique_work_items(results);
        let mut lines = vec![format!("**Work items summary ({}):**", work_items.len())];
        lines.extend(work_items.into_iter().map(work_item_link));
        lines
    }

    fn pull_request_search(&self, results: &[PullRequestSearchResult]) -> Vec<String> {
        let mut lines = vec!["**Pull Requests:**".to_string()];
        for (repository, prs) in group_by_repository(results, |pr| pr.repository_name.as_str()) {
            lines.push(format!(
                "* Repository name: {}. Pull Requests ({}):",
                repository,
                prs.len()
            ));
            for pr in prs {
                lines.push(format!(
                    "    * Title: *{}*. PullRequestId: [{}]({}). Status: {}. From: *'{}'*. To: *'{}'*. Work items: {}.",
                    pr.title,
                    pr.pull_request_id,
                    pr.url,
                    if pr.is_draft {
                        format!("{} (draft)", pr.status)
                    } else {
                        pr.status.to_string()
                    },
                    pr.source_branch,
                    pr.destination_branch,
                    pr.work_items
                        .iter()
                        .map(|item| format!("[{}]({})", item.id, item.url))
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            }
            lines.push(String::new());
        }
        lines
    }

    fn work_item_search(&self, results: &[WorkItemSearchResult]) -> Vec<String> {
        let mut lines = vec!["**Work items:**".to_string()];
        for (repository, group) in group_by_repository(results, |r| r.repository_name.as_str()) {
            let work_items: Vec<&WorkItem> = group.iter().flat_map(|r| &r.work_items).collect();
            lines.push(format!(
                "* Repository name: {}. Work items ({}):",
                repository,
                work_items.len()
            ));
            for item in work_items {
                lines.push(format!(
                    "    * Title: *{}*. State: *{}*. WorkItemId: [{}]({}). Area Path: *{}*. Iteration Path: *{}*.",
                    item.title,
                    or_dash(&item.state),
                    item.id,
                    item.url,
                    or_dash(&item.area_path),
                    or_dash(&item.iteration_path)
                ));
            }
            lines.push(String::new());
        }
        lines
    }

    fn repositories(&self, repositories: &[RepositoryInfo]) -> Vec<String> {
        let mut lines = vec![format!("**Repositories ({}):**", repositories.len())];
        for (index, repo) in repositories.iter().enumerate() {
            let mut line = format!("{}. [{}]({})", index + 1, repo.name, repo.url);
            if let Some(pipeline_url) = &repo.pipeline_url {
                line.push_str(&format!(". [Pipeline]({})", pipeline_url));
            }
            lines.push(line);
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::fixtures::{compare_result, pr_result};

    #[test]
    fn test_compare_results_sorted_by_name() {
        let lines = MarkdownGenerator.compare_results(
            3,
            &[
                compare_result("svc-c", 2),
                compare_result("svc-b", 0),
                compare_result("svc-a", 1),
            ],
        );
        assert_eq!(lines[0], "**Repositories count: 3**");
        assert_eq!(lines[2], "**Repositories without changes (1):**");
        assert!(lines[3].starts_with("1. Repository: *'svc-b'*"));
        assert_eq!(lines[5], "**Repositories with changes (2):**");
        assert!(lines[6].starts_with("1. Repository: *'svc-a'*"));
        assert!(lines[7].starts_with("2. Repository: *'svc-c'*"));
        assert!(lines[7].ends_with("Commits count: 2."));
    }

    #[test]
    fn test_work_items_summary_is_unique() {
        let lines = MarkdownGenerator
            .work_items_summary(&[pr_result("svc-a", 1, &[101, 102]), pr_result("svc-b", 2, &[101])]);
        assert_eq!(lines[0], "**Work items summary (2):**");
        assert_eq!(
            lines[1],
            "* Work Item Id: [101](https://dev.azure.com/acme/Core/_workitems/edit/101)"
        );
    }

    #[test]
    fn test_pull_request_results_list_failures() {
        let lines = MarkdownGenerator.pull_request_results(
            &[pr_result("svc-a", 17, &[101])],
            &[ReconcileFailure {
                repository_name: "svc-b".to_string(),
                error: "Azure DevOps request timed out".to_string(),
            }],
        );
        assert!(lines.contains(&"**Failed repositories (1):**".to_string()));
        assert!(lines.contains(&"**Pull Requests summary:**".to_string()));
        assert!(
            lines.contains(
                &"* PullRequestId: [17](https://dev.azure.com/acme/Core/_git/svc-a/pullrequest/17)"
                    .to_string()
            )
        );
    }
}
