use std::io::IsTerminal;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::{
    differ::BranchDiffer,
    fleet::{FleetConfig, resolve},
    stats,
};

const PROGRESS_TEMPLATE: &str = "{spinner} [{bar:30}] {pos}/{len} {msg}";

/// Branch difference for one repository of the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompareResult {
    pub repository_name: String,
    pub source_branch: String,
    pub destination_branch: String,
    pub changes_count: usize,
    /// Oldest first.
    pub commits: Vec<String>,
}

impl CompareResult {
    pub fn has_changes(&self) -> bool {
        self.changes_count > 0
    }
}

fn progress_bar(len: usize) -> ProgressBar {
    if !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar().template(PROGRESS_TEMPLATE) {
        bar.set_style(style.progress_chars("=> "));
    }
    bar
}

/// Compare source and destination branches of every repository in the
/// fleet. Repositories that cannot be compared are skipped with a warning;
/// results keep the fleet's order.
pub fn compare_fleet(fleet: &FleetConfig, differ: &dyn BranchDiffer) -> Vec<CompareResult> {
    let bar = progress_bar(fleet.repositories.len());
    let mut results = Vec::with_capacity(fleet.repositories.len());

    for descriptor in &fleet.repositories {
        bar.set_message(descriptor.name.clone());
        let repo = resolve(descriptor, fleet);
        let _scope = stats::enter_repository(&repo.name);

        if let Err(e) = repo.validate() {
            tracing::warn!(repository = %repo.name, "Skipping: {}", e);
            bar.inc(1);
            continue;
        }
        if let Err(reason) = differ.precheck(&repo) {
            tracing::warn!(
                repository = %repo.name,
                differ = differ.kind(),
                "Skipping: {}",
                reason
            );
            bar.inc(1);
            continue;
        }

        let source_ref = differ.ref_name(&repo.source_branch);
        let destination_ref = differ.ref_name(&repo.destination_branch);
        tracing::debug!(
            repository = %repo.name,
            "Comparing {} -> {}",
            source_ref,
            destination_ref
        );

        match differ.compare_branches(&repo, &source_ref, &destination_ref) {
            Ok(comparison) => {
                tracing::info!(
                    repository = %repo.name,
                    changes = comparison.count,
                    "{} -> {}",
                    repo.source_branch,
                    repo.destination_branch
                );
                results.push(CompareResult {
                    repository_name: repo.name,
                    source_branch: repo.source_branch,
                    destination_branch: repo.destination_branch,
                    changes_count: comparison.count,
                    commits: comparison.commits,
                });
            }
            Err(e) => {
                tracing::warn!(repository = %repo.name, error = ?e, "Comparison failed, skipping");
            }
        }
        bar.inc(1);
    }

    bar.finish_and_clear();
    results
}
