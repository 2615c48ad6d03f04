//! Report generation for console and per-run output files.

mod markdown;
mod text;

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use colored::Colorize;
use serde::{Deserialize, Serialize};

pub use markdown::MarkdownGenerator;
pub use text::TextGenerator;

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

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Markdown,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Text => "txt",
            Self::Markdown => "md",
        }
    }

    pub fn generator(&self) -> Box<dyn ContentGenerator> {
        match self {
            Self::Text => Box::new(TextGenerator),
            Self::Markdown => Box::new(MarkdownGenerator),
        }
    }
}

/// Renders each kind of result into report lines.
pub trait ContentGenerator {
    /// Repositories without and with changes, each group sorted by name.
    fn compare_results(&self, repository_count: usize, results: &[CompareResult]) -> Vec<String>;

    /// Per pull request details, then a pull request summary and the
    /// unique work items across all of them.
    fn pull_request_results(
        &self,
        results: &[PullRequestResult],
        failures: &[ReconcileFailure],
    ) -> Vec<String>;

    fn pull_requests_summary(&self, results: &[PullRequestResult]) -> Vec<String>;

    fn work_items_summary(&self, results: &[PullRequestResult]) -> Vec<String>;

    fn pull_request_search(&self, results: &[PullRequestSearchResult]) -> Vec<String>;

    fn work_item_search(&self, results: &[WorkItemSearchResult]) -> Vec<String>;

    fn repositories(&self, repositories: &[RepositoryInfo]) -> Vec<String>;
}

/// Work items of all results, first occurrence of each id.
pub(crate) fn unique_work_items(results: &[PullRequestResult]) -> Vec<&WorkItem> {
    let mut seen = HashSet::new();
    results
        .iter()
        .flat_map(|result| &result.work_items)
        .filter(|item| seen.insert(item.id))
        .collect()
}

/// Group items by key, groups in order of first appearance.
pub(crate) fn group_by_repository<'r, T>(
    items: &'r [T],
    key: impl Fn(&T) -> &str,
) -> Vec<(&'r str, Vec<&'r T>)> {
    let mut groups: Vec<(&str, Vec<&T>)> = Vec::new();
    for item in items {
        let name = key(item);
        match groups.iter_mut().find(|(group, _)| *group == name) {
            Some((_, members)) => members.push(item),
            None => groups.push((name, vec![item])),
        }
    }
    groups
}

/// Compare results split by whether they have changes, sorted by name.
pub(crate) fn split_by_changes(results: &[CompareResult]) -> (Vec<&CompareResult>, Vec<&CompareResult>) {
    let (mut changed, mut unchanged): (Vec<_>, Vec<_>) =
        results.iter().partition(|result| result.has_changes());
    changed.sort_by(|a, b| a.repository_name.cmp(&b.repository_name));
    unchanged.sort_by(|a, b| a.repository_name.cmp(&b.repository_name));
    (unchanged, changed)
}

/// One run's output directory: `<output>/<command>-<dd-MM-yyyy-HH-mm>/`.
#[derive(Debug, Clone)]
pub struct OutputBatch {
    pub directory: PathBuf,
    pub run_id: String,
}

impl OutputBatch {
    pub fn start(output_dir: &Path, command_name: &str) -> Result<Self> {
        let directory = output_dir.join(format!(
            "{}-{}",
            command_name,
            chrono::Local::now().format("%d-%m-%Y-%H-%M")
        ));
        fs::create_dir_all(&directory)
            .with_context(|| format!("creating output directory {}", directory.display()))?;
        let run_id = format!("{:032x}", rand::random::<u128>());
        tracing::debug!(directory = %directory.display(), run_id, "Initialized output batch");
        Ok(Self { directory, run_id })
    }

    pub fn file_path(&self, kind: ReportKind, format: OutputFormat) -> PathBuf {
        self.directory.join(format!(
            "{}-{}.{}",
            self.run_id,
            kind.suffix(),
            format.extension()
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Compare,
    Full,
    PullRequests,
    WorkItems,
    Repositories,
}

impl ReportKind {
    fn suffix(&self) -> &'static str {
        match self {
            Self::Compare => "compare",
            Self::Full => "full",
            Self::PullRequests => "prs",
            Self::WorkItems => "work-items",
            Self::Repositories => "repositories",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::Compare => "Compare results",
            Self::Full => "Full results",
            Self::PullRequests => "Pull requests",
            Self::WorkItems => "Work items",
            Self::Repositories => "Repositories",
        }
    }
}

/// Where reports go for one command.
pub struct ReportWriter {
    format: OutputFormat,
    generator: Box<dyn ContentGenerator>,
    console: bool,
    batch: Option<OutputBatch>,
}

impl ReportWriter {
    /// `batch` is required for file output; `None` disables it.
    pub fn new(format: OutputFormat, console: bool, batch: Option<OutputBatch>) -> Self {
        Self {
            format,
            generator: format.generator(),
            console,
            batch,
        }
    }

    pub fn emit(&self, kind: ReportKind, lines: &[String]) -> Result<()> {
        if self.console {
            println!("{}", format!("=== {} ===", kind.title()).yellow().bold());
            for line in lines {
                println!("{}", line);
            }
            println!();
        }
        if let Some(batch) = &self.batch {
            let path = batch.file_path(kind, self.format);
            let mut contents = lines.join("\n");
            contents.push('\n');
            fs::write(&path, contents)
                .with_context(|| format!("writing report {}", path.display()))?;
            tracing::info!("Wrote {}", path.display());
        }
        Ok(())
    }

    pub fn compare_results(&self, repository_count: usize, results: &[CompareResult]) -> Result<()> {
        self.emit(
            ReportKind::Compare,
            &self.generator.compare_results(repository_count, results),
        )
    }

    /// Compare and pull request results together, then the pull request ids
    /// and the work items on their own.
    pub fn full_results(
        &self,
        repository_count: usize,
        compare_results: &[CompareResult],
        results: &[PullRequestResult],
        failures: &[ReconcileFailure],
    ) -> Result<()> {
        let mut lines = self.generator.compare_results(repository_count, compare_results);
        lines.extend(self.generator.pull_request_results(results, failures));
        self.emit(ReportKind::Full, &lines)?;

        if results.iter().any(|result| result.pull_request_id != 0) {
            self.emit(
                ReportKind::PullRequests,
                &self.generator.pull_requests_summary(results),
            )?;
        }
        self.emit(
            ReportKind::WorkItems,
            &self.generator.work_items_summary(results),
        )
    }

    pub fn pull_request_results(
        &self,
        results: &[PullRequestResult],
        failures: &[ReconcileFailure],
    ) -> Result<()> {
        self.emit(
            ReportKind::PullRequests,
            &self.generator.pull_request_results(results, failures),
        )
    }

    pub fn pull_request_search(&self, results: &[PullRequestSearchResult]) -> Result<()> {
        if results.is_empty() {
            tracing::info!("No pull requests found");
            return Ok(());
        }
        self.emit(
            ReportKind::PullRequests,
            &self.generator.pull_request_search(results),
        )
    }

    pub fn work_item_search(&self, results: &[WorkItemSearchResult]) -> Result<()> {
        self.emit(ReportKind::WorkItems, &self.generator.work_item_search(results))
    }

    pub fn repositories(&self, repositories: &[RepositoryInfo]) -> Result<()> {
        self.emit(
            ReportKind::Repositories,
            &self.generator.repositories(repositories),
        )
    }
}
