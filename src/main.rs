use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args as ClapArgs, CommandFactory, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::{
    compare::{CompareResult, compare_fleet},
    config::{AppConfig, load_config},
    devops::{DevOpsClient, PullRequestStatus},
    differ::RemoteDiffer,
    git2_ops::LocalDiffer,
    output::{OutputBatch, ReportWriter},
    pull_request::Reconciler,
};

mod compare;
mod config;
mod devops;
mod differ;
mod fleet;
mod git2_ops;
mod output;
mod pull_request;
mod stats;
mod work_items;

#[derive(Parser)]
#[command(author, version, about, arg_required_else_help = true)]
struct Args {
    #[arg(long, short, help = "Enable verbose output")]
    verbose: bool,

    /// Configuration file (defaults to $XDG_CONFIG_HOME/fleet-pr/config.yaml).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Print a timing summary of git and API calls.
    #[arg(long, global = true)]
    stats: bool,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Commands,
}

#[derive(ClapArgs, Clone, Copy)]
struct OutputArgs {
    /// Print reports to the console (the default when --file is not given).
    #[arg(long)]
    console: bool,

    /// Write reports to a new run directory under the configured output directory.
    #[arg(long)]
    file: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
enum CompareMode {
    /// Local clones through libgit2.
    Local,
    /// Azure DevOps commit queries.
    #[default]
    Remote,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare source and destination branches in local clones.
    CompareLocal {
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Compare source and destination branches through Azure DevOps.
    CompareRemote {
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Create (or find) a pull request for every repository with changes.
    CreatePrs {
        #[arg(long, value_enum, default_value_t)]
        compare: CompareMode,
        /// Report what would be created without creating anything.
        #[arg(long)]
        dry_run: bool,
        /// Apply the configured work item filter.
        #[arg(long)]
        filter: bool,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Create (or find) the single pull request described by `custom_pr`.
    CreateCustomPr {
        /// Report what would be created without creating anything.
        #[arg(long, short)]
        dry_run: bool,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Search pull requests from source or into destination branches.
    SearchPrs {
        /// a (active), c (completed), b (abandoned) or all.
        #[arg(long, default_value = "a")]
        status: PullRequestStatus,
        /// Maximum pull requests per query.
        #[arg(long, default_value_t = 10)]
        count: u32,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// List work items linked to pending commits.
    SearchWorkItems {
        #[arg(long, value_enum, default_value_t)]
        compare: CompareMode,
        /// Apply the configured work item filter.
        #[arg(long)]
        filter: bool,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// List repositories of a team project.
    Repositories {
        /// Defaults to azure_devops.team_project.
        #[arg(long)]
        project: Option<String>,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::CompareLocal { .. } => "compare-local",
            Commands::CompareRemote { .. } => "compare-remote",
            Commands::CreatePrs { .. } => "create-prs",
            Commands::CreateCustomPr { .. } => "create-custom-pr",
            Commands::SearchPrs { .. } => "search-prs",
            Commands::SearchWorkItems { .. } => "search-work-items",
            Commands::Repositories { .. } => "repositories",
            Commands::Completions { .. } => "completions",
        }
    }
}

fn main() {
    if let Err(e) = inner_main() {
        tracing::error!(error = ?e);
        std::process::exit(1);
    }
    std::process::exit(0);
}

fn inner_main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = args.command {
        clap_complete::generate(
            shell,
            &mut Args::command(),
            env!("CARGO_PKG_NAME"),
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    let config = load_config(args.config.clone())?;
    let result = run(&config, &args.command);
    if args.stats {
        stats::print_summary();
    }
    result
}

fn writer(config: &AppConfig, command: &Commands, output: OutputArgs) -> Result<ReportWriter> {
    let batch = if output.file {
        Some(OutputBatch::start(&config.output.directory, command.name())?)
    } else {
        None
    };
    Ok(ReportWriter::new(
        config.output.format,
        output.console || !output.file,
        batch,
    ))
}

fn compare_with(config: &AppConfig, mode: CompareMode, client: &DevOpsClient) -> Vec<CompareResult> {
    tracing::info!(?mode, "Comparing {} repositories", config.repositories.repositories.len());
    match mode {
        CompareMode::Local => compare_fleet(&config.repositories, &LocalDiffer::default()),
        CompareMode::Remote => compare_fleet(&config.repositories, &RemoteDiffer::new(client)),
    }
}

fn reconciler<'a>(config: &'a AppConfig, client: &'a DevOpsClient) -> Reconciler<'a> {
    Reconciler::new(
        client,
        &config.repositories,
        &config.work_item_filter,
        &config.identities,
        &config.default_reviewers,
    )
}

fn run(config: &AppConfig, command: &Commands) -> Result<()> {
    let repository_count = config.repositories.repositories.len();
    match *command {
        Commands::CompareLocal { output } => {
            let results = compare_fleet(&config.repositories, &LocalDiffer::default());
            writer(config, command, output)?.compare_results(repository_count, &results)
        }
        Commands::CompareRemote { output } => {
            let client = DevOpsClient::from_config(config)?;
            let results = compare_fleet(&config.repositories, &RemoteDiffer::new(&client));
            writer(config, command, output)?.compare_results(repository_count, &results)
        }
        Commands::CreatePrs {
            compare,
            dry_run,
            filter,
            output,
        } => {
            let client = DevOpsClient::from_config(config)?;
            let compare_results = compare_with(config, compare, &client);
            let report = reconciler(config, &client)
                .with_filter(filter)
                .reconcile_all(&compare_results, &config.pull_request, dry_run)?;
            writer(config, command, output)?.full_results(
                repository_count,
                &compare_results,
                &report.results,
                &report.failures,
            )?;
            if !report.failures.is_empty() {
                bail!(
                    "{} of {} repositories could not be reconciled",
                    report.failures.len(),
                    report.failures.len() + report.results.len()
                );
            }
            Ok(())
        }
        Commands::CreateCustomPr { dry_run, output } => {
            let Some(custom) = &config.custom_pr else {
                bail!("No custom_pr section in the configuration");
            };
            let client = DevOpsClient::from_config(config)?;
            let result = reconciler(config, &client).create_custom(custom, dry_run)?;
            writer(config, command, output)?.pull_request_results(&[result], &[])
        }
        Commands::SearchPrs {
            status,
            count,
            output,
        } => {
            let client = DevOpsClient::from_config(config)?;
            let results = reconciler(config, &client).search_pull_requests(status, count)?;
            writer(config, command, output)?.pull_request_search(&results)
        }
        Commands::SearchWorkItems {
            compare,
            filter,
            output,
        } => {
            let client = DevOpsClient::from_config(config)?;
            let compare_results = compare_with(config, compare, &client);
            let results = reconciler(config, &client).search_work_items(&compare_results, filter)?;
            writer(config, command, output)?.work_item_search(&results)
        }
        Commands::Repositories {
            ref project,
            output,
        } => {
            let client = DevOpsClient::from_config(config)?;
            let project = project
                .as_deref()
                .unwrap_or(&config.azure_devops.team_project);
            if project.is_empty() {
                bail!("No project given; pass --project or set azure_devops.team_project");
            }
            let repositories = reconciler(config, &client).list_repositories(project)?;
            writer(config, command, output)?.repositories(&repositories)
        }
        Commands::Completions { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_create_prs_flags() {
        let args = Args::try_parse_from([
            "fleet-pr",
            "--stats",
            "create-prs",
            "--compare",
            "local",
            "--dry-run",
            "--file",
        ])
        .unwrap();
        assert!(args.stats);
        match args.command {
            Commands::CreatePrs {
                compare,
                dry_run,
                filter,
                output,
            } => {
                assert!(matches!(compare, CompareMode::Local));
                assert!(dry_run);
                assert!(!filter);
                assert!(output.file);
                assert!(!output.console);
            }
            _ => panic!("expected create-prs"),
        }
    }

    #[test]
    fn test_parse_create_custom_pr() {
        let args = Args::try_parse_from(["fleet-pr", "create-custom-pr", "-d", "--console"]).unwrap();
        assert_eq!(args.command.name(), "create-custom-pr");
        match args.command {
            Commands::CreateCustomPr { dry_run, output } => {
                assert!(dry_run);
                assert!(output.console);
            }
            _ => panic!("expected create-custom-pr"),
        }
    }

    #[test]
    fn test_parse_search_prs_defaults() {
        let args = Args::try_parse_from(["fleet-pr", "search-prs", "--status", "c"]).unwrap();
        match args.command {
            Commands::SearchPrs { status, count, .. } => {
                assert_eq!(status, PullRequestStatus::Completed);
                assert_eq!(count, 10);
            }
            _ => panic!("expected search-prs"),
        }
    }
}
