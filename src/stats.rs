//! Timing of git2 and REST calls, grouped by call and by the fleet
//! repository being processed when the call was made.

use std::{cell::RefCell, collections::BTreeMap, time::Duration};

use colored::Colorize;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Timing {
    pub count: u64,
    pub failures: u64,
    pub total: Duration,
    pub max: Duration,
}

impl Timing {
    fn add(&mut self, duration: Duration, ok: bool) {
        self.count += 1;
        self.failures += u64::from(!ok);
        self.total += duration;
        self.max = self.max.max(duration);
    }

    pub fn avg(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(count) => self.total / count,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct RepositoryStats {
    pub timing: Timing,
    /// Call with the longest single duration.
    pub slowest: Option<(String, Duration)>,
}

#[derive(Debug, Default, Clone)]
pub struct RunStats {
    /// Keyed by call name, e.g. "git2:compare" or "api:pullrequests"
    pub by_call: BTreeMap<String, Timing>,
    /// Only calls made inside a [`RepositoryScope`].
    pub by_repository: BTreeMap<String, RepositoryStats>,
    pub total: Timing,
}

impl RunStats {
    pub fn record(&mut self, repository: Option<&str>, call: &str, duration: Duration, ok: bool) {
        self.total.add(duration, ok);
        self.by_call.entry(call.to_string()).or_default().add(duration, ok);

        let Some(repository) = repository else {
            return;
        };
        let entry = self.by_repository.entry(repository.to_string()).or_default();
        entry.timing.add(duration, ok);
        if entry.slowest.as_ref().is_none_or(|(_, max)| duration > *max) {
            entry.slowest = Some((call.to_string(), duration));
        }
    }
}

#[derive(Default)]
struct Recorder {
    stats: RunStats,
    repository: Option<String>,
}

thread_local! {
    static RECORDER: RefCell<Recorder> = RefCell::new(Recorder::default());
}

/// Attributes calls to a repository until dropped.
#[must_use]
pub struct RepositoryScope {
    previous: Option<String>,
}

impl Drop for RepositoryScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        RECORDER.with(|recorder| recorder.borrow_mut().repository = previous);
    }
}

pub fn enter_repository(name: &str) -> RepositoryScope {
    let previous = RECORDER.with(|recorder| {
        recorder
            .borrow_mut()
            .repository
            .replace(name.to_string())
    });
    RepositoryScope { previous }
}

/// Record one git2 or REST call against the current repository, if any.
pub fn record_call(call: &str, duration: Duration, ok: bool) {
    RECORDER.with(|recorder| {
        let mut recorder = recorder.borrow_mut();
        let Recorder { stats, repository } = &mut *recorder;
        stats.record(repository.as_deref(), call, duration, ok);
    });
}

pub fn get_stats() -> RunStats {
    RECORDER.with(|recorder| recorder.borrow().stats.clone())
}

fn timing_row(label: &str, timing: &Timing) -> String {
    format!(
        "{:<28} {:>8} {:>8} {:>12.2?} {:>12.2?} {:>12.2?}",
        label,
        timing.count,
        timing.failures,
        timing.total,
        timing.avg(),
        timing.max
    )
}

/// Print a timing summary to stderr
pub fn print_summary() {
    let stats = get_stats();
    if stats.total.count == 0 {
        return;
    }

    let header = format!(
        "{:<28} {:>8} {:>8} {:>12} {:>12} {:>12}",
        "", "Count", "Failed", "Total", "Avg", "Max"
    );

    eprintln!();
    eprintln!("{}", "=== Calls ===".yellow().bold());
    eprintln!("{}", header);
    let mut calls: Vec<_> = stats.by_call.iter().collect();
    calls.sort_by(|a, b| b.1.total.cmp(&a.1.total));
    for (call, timing) in calls {
        eprintln!("{}", timing_row(call, timing));
    }
    eprintln!("{}", "-".repeat(84));
    eprintln!("{}", timing_row("TOTAL", &stats.total).as_str().bold());

    if !stats.by_repository.is_empty() {
        eprintln!();
        eprintln!("{}", "=== Repositories ===".yellow().bold());
        eprintln!("{}  Slowest call", header);
        let mut repositories: Vec<_> = stats.by_repository.iter().collect();
        repositories.sort_by(|a, b| b.1.timing.total.cmp(&a.1.timing.total));
        for (repository, repository_stats) in repositories {
            let slowest = repository_stats
                .slowest
                .as_ref()
                .map(|(call, _)| call.as_str())
                .unwrap_or("-");
            eprintln!(
                "{}  {}",
                timing_row(repository, &repository_stats.timing),
                slowest
            );
        }
    }
    eprintln!();
}
