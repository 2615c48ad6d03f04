//! Work item model plus the dedupe/filter pass applied before attaching
//! work items to a pull request or reporting them.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// A ticket from the Azure Boards tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItem {
    pub id: u64,
    pub title: String,
    pub work_item_type: Option<String>,
    pub area_path: Option<String>,
    pub iteration_path: Option<String>,
    pub state: Option<String>,
    pub url: String,
}

/// Allowlists applied when filtering is requested, plus ticket ids that
/// are attached to every new pull request.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WorkItemFilter {
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub areas: Vec<String>,
    #[serde(default)]
    pub iterations: Vec<String>,
    #[serde(default)]
    pub always_include: Vec<u64>,
}

fn keep_allowed<F>(items: Vec<WorkItem>, allowlist: &[String], field: F) -> Vec<WorkItem>
where
    F: Fn(&WorkItem) -> Option<&String>,
{
    if allowlist.is_empty() {
        return items;
    }
    items
        .into_iter()
        .filter(|item| field(item).is_some_and(|value| allowlist.contains(value)))
        .collect()
}

/// Narrow `items` by the filter's allowlists (when `apply_filter`) and drop
/// repeated ids, keeping the first occurrence of each.
pub fn dedupe_and_filter(
    items: Vec<WorkItem>,
    filter: &WorkItemFilter,
    apply_filter: bool,
) -> Vec<WorkItem> {
    let items = if apply_filter {
        let items = keep_allowed(items, &filter.types, |item| item.work_item_type.as_ref());
        let items = keep_allowed(items, &filter.areas, |item| item.area_path.as_ref());
        keep_allowed(items, &filter.iterations, |item| item.iteration_path.as_ref())
    } else {
        items
    };

    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.id))
        .collect()
}

/// Ids from `always_include` that are not already among `ids`, in config order.
pub fn extra_ids(filter: &WorkItemFilter, ids: &[u64]) -> Vec<u64> {
    let mut seen: HashSet<u64> = ids.iter().copied().collect();
    filter
        .always_include
        .iter()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect()
}

#[cfg(test)]
pub(crate) fn work_item(id: u64, work_item_type: &str) -> WorkItem {
    WorkItem {
        id,
        title: format!("Ticket {id}"),
        work_item_type: Some(work_item_type.to_string()),
        area_path: Some("Core\\Payments".to_string()),
        iteration_path: Some("Core\\Sprint 7".to_string()),
        state: Some("Active".to_string()),
        url: format!("https://dev.azure.com/acme/Core/_workitems/edit/{id}"),
    }
}
