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

pub struct TextGenerator;

fn work_item_line(item: &WorkItem) -> String {
    format!("  {} {}", item.id, item.url)
}

impl ContentGenerator for TextGenerator {
    fn compare_results(&self, repository_count: usize, results: &[CompareResult]) -> Vec<String> {
        let (unchanged, changed) = split_by_changes(results);
        let mut lines = vec![format!("Repositories count: {}", repository_count), String::new()];

        lines.push(format!("Repositories without changes ({}):", unchanged.len()));
        for (index, result) in unchanged.iter().enumerate() {
            lines.push(format!(
                "{}. {}: no changes between '{}' and '{}'",
                index + 1,
                result.repository_name,
                result.source_branch,
                result.destination_branch
            ));
        }
        lines.push(String::new());

        lines.push(format!("Repositories with changes ({}):", changed.len()));
        for (index, result) in changed.iter().enumerate() {
            lines.push(format!(
                "{}. {}: {} commits between '{}' and '{}'",
                index + 1,
                result.repository_name,
                result.changes_count,
                result.source_branch,
                result.destination_branch
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
            lines.push(format!("{}: {}", index + 1, result.repository_name));
            if result.pull_request_id == 0 {
                lines.push(format!("  No pull request ({})", result.outcome));
            } else {
                lines.push(format!(
                    "  Pull request {} ({}): {}",
                    result.pull_request_id, result.outcome, result.url
                ));
            }
            lines.push(format!("  Work items ({}):", result.work_items.len()));
            lines.extend(
                result
                    .work_items
                    .iter()
                    .map(|item| format!("  {}", work_item_line(item))),
            );
            lines.push(String::new());
        }

        if !failures.is_empty() {
            lines.push(format!("Failed repositories ({}):", failures.len()));
            lines.extend(
                failures
                    .iter()
                    .map(|failure| format!("  {}: {}", failure.repository_name, failure.error)),
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
        let mut lines = vec!["Pull requests:".to_string()];
        lines.extend(
            results
                .iter()
                .filter(|result| result.pull_request_id != 0)
                .map(|result| format!("  {} {}", result.pull_request_id, result.url)),
        );
        lines
    }

    fn work_items_summary(&self, results: &[PullRequestResult]) -> Vec<String> {
        let work_items = unique_work_items(results);
        let mut lines = vec![format!("Work items ({}):", work_items.len())];
        lines.extend(work_items.into_iter().map(work_item_line));
        lines
    }

    fn pull_request_search(&self, results: &[PullRequestSearchResult]) -> Vec<String> {
        let mut lines = Vec::new();
        for (repository, prs) in group_by_repository(results, |pr| pr.repository_name.as_str()) {
            lines.push(format!("{} ({}):", repository, prs.len()));
            for pr in prs {
                let status = if pr.is_draft {
                    format!("{}, draft", pr.status)
                } else {
                    pr.status.to_string()
                };
                lines.push(format!(
                    "  {} [{}] {} ({} -> {}) {}",
                    pr.pull_request_id,
                    status,
                    pr.title,
                    pr.source_branch,
                    pr.destination_branch,
                    pr.url
                ));
                lines.extend(
                    pr.work_items
                        .iter()
                        .map(|item| format!("  {}", work_item_line(item))),
                );
            }
            lines.push(String::new());
        }
        lines
    }

    fn work_item_search(&self, results: &[WorkItemSearchResult]) -> Vec<String> {
        let mut lines = Vec::new();
        for (repository, group) in group_by_repository(results, |r| r.repository_name.as_str()) {
            let work_items: Vec<&WorkItem> = group.iter().flat_map(|r| &r.work_items).collect();
            lines.push(format!("{} ({}):", repository, work_items.len()));
            for item in work_items {
                lines.push(format!(
                    "  {} [{}] {} ({}, {}) {}",
                    item.id,
                    item.state.as_deref().unwrap_or("-"),
                    item.title,
                    item.area_path.as_deref().unwrap_or("-"),
                    item.iteration_path.as_deref().unwrap_or("-"),
                    item.url
                ));
            }
            lines.push(String::new());
        }
        lines
    }

    fn repositories(&self, repositories: &[RepositoryInfo]) -> Vec<String> {
        let width = repositories
            .iter()
            .map(|repo| repo.name.len())
            .max()
            .unwrap_or(0);
        repositories
            .iter()
            .map(|repo| match &repo.pipeline_url {
                Some(pipeline_url) => {
                    format!("{:<width$}  {}  {}", repo.name, repo.url, pipeline_url)
                }
                None => format!("{:<width$}  {}", repo.name, repo.url),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        devops::PullRequestStatus,
        output::fixtures::{compare_result, pr_result},
        work_items::work_item,
    };

    #[test]
    fn test_compare_results_text() {
        let lines =
            TextGenerator.compare_results(2, &[compare_result("svc-a", 3), compare_result("svc-b", 0)]);
        assert_eq!(
            lines,
            vec![
                "Repositories count: 2",
                "",
                "Repositories without changes (1):",
                "1. svc-b: no changes between 'develop' and 'main'",
                "",
                "Repositories with changes (1):",
                "1. svc-a: 3 commits between 'develop' and 'main'",
                "",
            ]
        );
    }

    #[test]
    fn test_dry_run_result_has_no_pull_request_summary() {
        let lines = TextGenerator.pull_request_results(&[pr_result("svc-a", 0, &[101])], &[]);
        assert!(lines.iter().all(|line| line != "Pull requests:"));
        assert!(lines.contains(&"Work items (1):".to_string()));
    }

    #[test]
    fn test_search_results_grouped_by_repository() {
        let pr = |repository: &str, id: u64| PullRequestSearchResult {
            repository_name: repository.to_string(),
            pull_request_id: id,
            title: "Release".to_string(),
            description: String::new(),
            source_branch: "develop".to_string(),
            destination_branch: "main".to_string(),
            status: PullRequestStatus::Active,
            is_draft: id == 3,
            url: format!("https://dev.azure.com/acme/Core/_git/{repository}/pullrequest/{id}"),
            work_items: vec![work_item(101, "Bug")],
        };
        let lines = TextGenerator.pull_request_search(&[pr("svc-a", 1), pr("svc-b", 2), pr("svc-a", 3)]);
        assert_eq!(lines[0], "svc-a (2):");
        assert!(lines[1].starts_with("  1 [active] Release (develop -> main)"));
        assert!(lines[3].starts_with("  3 [active, draft] Release (develop -> main)"));
        assert!(lines.contains(&"svc-b (1):".to_string()));
    }
}
