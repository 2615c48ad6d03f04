use std::{fs, path::PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::{
    fleet::FleetConfig,
    output::OutputFormat,
    pull_request::{CustomPullRequest, IdentityMap, PullRequestSpec},
    work_items::WorkItemFilter,
};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DEADLINE_SECS: u64 = 15 * 60;

/// Problems an operator has to fix in the configuration file. These abort
/// the run rather than being skipped or retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Author or reviewer name missing from `identities`
    UnknownIdentity(String),
    /// Repository name not present in the fleet
    UnknownRepository(String),
    /// Neither the repository nor the fleet defaults name a branch
    MissingBranch {
        repository: String,
        side: &'static str,
    },
    /// Neither the repository nor the fleet defaults name a team project
    MissingProject(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownIdentity(name) => {
                write!(f, "No identity configured for '{}' (see `identities`)", name)
            }
            Self::UnknownRepository(name) => {
                write!(f, "Repository '{}' is not part of the fleet", name)
            }
            Self::MissingBranch { repository, side } => write!(
                f,
                "Repository '{}' has no {} branch and no fleet default",
                repository, side
            ),
            Self::MissingProject(repository) => write!(
                f,
                "Repository '{}' has no project and no azure_devops.team_project",
                repository
            ),
            Self::Invalid(message) => write!(f, "Invalid configuration: {}", message),
        }
    }
}

impl std::error::Error for ConfigurationError {}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AzureDevOpsConfig {
    /// e.g. `https://dev.azure.com/acme`
    pub collection_url: String,
    /// Project used when a repository and the fleet name none.
    #[serde(default)]
    pub team_project: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Per-request timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Budget for all remote calls of one run.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl AzureDevOpsConfig {
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    pub fn deadline_secs(&self) -> u64 {
        self.deadline_secs.unwrap_or(DEFAULT_DEADLINE_SECS)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub format: OutputFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
            format: OutputFormat::default(),
        }
    }
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("output")
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub azure_devops: AzureDevOpsConfig,
    #[serde(default)]
    pub repositories: FleetConfig,
    #[serde(default)]
    pub pull_request: PullRequestSpec,
    #[serde(default)]
    pub work_item_filter: WorkItemFilter,
    #[serde(default)]
    pub identities: IdentityMap,
    /// Reviewers added when `pull_request.reviewers` is empty.
    #[serde(default)]
    pub default_reviewers: Vec<String>,
    #[serde(default)]
    pub output: OutputConfig,
    /// Single pull request for `create-custom-pr`.
    #[serde(default)]
    pub custom_pr: Option<CustomPullRequest>,
}

impl AppConfig {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let mut config: AppConfig = serde_yaml::from_str(contents)?;
        if config.repositories.default_project.is_empty() {
            config.repositories.default_project = config.azure_devops.team_project.clone();
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let mut names = std::collections::HashSet::new();
        for repository in &self.repositories.repositories {
            if repository.name.is_empty() {
                return Err(ConfigurationError::Invalid(
                    "repository entry without a name".to_string(),
                ));
            }
            if !names.insert(repository.name.as_str()) {
                return Err(ConfigurationError::Invalid(format!(
                    "repository '{}' is listed twice",
                    repository.name
                )));
            }
        }
        Ok(())
    }

    /// Azure DevOps personal access token, looked up in the environment first.
    pub fn token(&self) -> Option<String> {
        for var in ["AZURE_DEVOPS_TOKEN", "AZURE_DEVOPS_EXT_PAT"] {
            if let Ok(token) = std::env::var(var)
                && !token.is_empty()
            {
                tracing::debug!("Using Azure DevOps token from {} env var", var);
                return Some(token);
            }
        }
        self.azure_devops
            .token
            .clone()
            .filter(|token| !token.is_empty())
            .inspect(|_| tracing::debug!("Using Azure DevOps token from config file"))
    }
}

pub fn load_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let config_path = match path {
        Some(path) => path,
        None => get_xdg_path()?,
    };
    tracing::debug!(?config_path, "Loading configuration");
    let data = fs::read_to_string(&config_path)
        .with_context(|| format!("reading config file {}", config_path.display()))?;
    AppConfig::from_yaml(&data).with_context(|| format!("parsing {}", config_path.display()))
}

fn get_xdg_path() -> Result<PathBuf> {
    let base_dirs = xdg::BaseDirectories::with_prefix(env!("CARGO_PKG_NAME"));
    base_dirs
        .find_config_file("config.yaml")
        .ok_or_else(|| anyhow!("No config.yaml found; pass --config <PATH>"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
azure_devops:
  collection_url: https://dev.azure.com/acme
  team_project: Core
  timeout_secs: 10
repositories:
  default_source_branch: develop
  default_destination_branch: main
  repositories:
    - name: svc-a
      path: /src/svc-a
    - name: svc-b
      project: Platform
      pipeline_id: 42
pull_request:
  title: Release 2.0
  description: Merge develop into main
  author: Release Bot
  tags: [release]
  autocomplete: true
work_item_filter:
  types: [Bug, Story]
  always_include: [900]
identities:
  Release Bot: 0b5c2f8e-0000-4000-8000-000000000001
  Platform Team: 0b5c2f8e-0000-4000-8000-000000000002
default_reviewers: [Platform Team]
output:
  format: markdown
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.repositories.repositories.len(), 2);
        assert_eq!(config.repositories.default_project, "Core");
        assert_eq!(config.azure_devops.timeout_secs(), 10);
        assert_eq!(config.azure_devops.deadline_secs(), DEFAULT_DEADLINE_SECS);
        assert_eq!(config.pull_request.title, "Release 2.0");
        assert!(config.pull_request.autocomplete);
        assert!(!config.pull_request.draft);
        assert_eq!(config.work_item_filter.always_include, vec![900]);
        assert_eq!(config.output.format, OutputFormat::Markdown);
        assert_eq!(config.output.directory, PathBuf::from("output"));
        assert!(config.identities.resolve("Release Bot").is_ok());
        assert!(config.custom_pr.is_none());
    }

    #[test]
    fn test_parse_custom_pr_section() {
        let yaml = r#"
azure_devops:
  collection_url: https://dev.azure.com/acme
  team_project: Core
custom_pr:
  repository: tools
  project: Platform
  source_branch: feature/cli
  destination_branch: develop
  author: Release Bot
  title: CLI rework
  description: Move the CLI to subcommands
  draft: true
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        let custom = config.custom_pr.unwrap();
        assert_eq!(custom.repository, "tools");
        assert_eq!(custom.project.as_deref(), Some("Platform"));
        assert_eq!(custom.source_branch, "feature/cli");
        assert_eq!(custom.pull_request.title, "CLI rework");
        assert_eq!(custom.pull_request.author.as_deref(), Some("Release Bot"));
        assert!(custom.pull_request.draft);
        assert!(!custom.pull_request.autocomplete);
    }

    #[test]
    fn test_duplicate_repository_names_are_rejected() {
        let yaml = r#"
azure_devops:
  collection_url: https://dev.azure.com/acme
repositories:
  repositories:
    - name: svc-a
    - name: svc-a
"#;
        let error = AppConfig::from_yaml(yaml).unwrap_err();
        assert!(error.to_string().contains("listed twice"));
    }

    #[test]
    fn test_markdown_table_format_is_rejected() {
        let yaml = r#"
output:
  format: markdown-table
"#;
        assert!(AppConfig::from_yaml(yaml).is_err());
    }
}
