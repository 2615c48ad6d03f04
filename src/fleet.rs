//! Repository fleet configuration and per-repository override resolution.

use serde::{Deserialize, Serialize};

use crate::config::ConfigurationError;

/// One repository in the fleet, as written in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RepositoryDescriptor {
    /// Unique key; also the repository name on the remote.
    pub name: String,
    /// Local clone, only needed for local comparison.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub source_branch: Option<String>,
    #[serde(default)]
    pub destination_branch: Option<String>,
    /// Owning team project, overrides the fleet default.
    #[serde(default)]
    pub project: Option<String>,
    /// Build pipeline definition id (used only for report links).
    #[serde(default)]
    pub pipeline_id: Option<u32>,
}

/// The configured set of repositories plus fleet-wide defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub repositories: Vec<RepositoryDescriptor>,
    #[serde(default)]
    pub default_source_branch: String,
    #[serde(default)]
    pub default_destination_branch: String,
    #[serde(default)]
    pub default_project: String,
}

/// A repository with every override filled in from the fleet defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRepository {
    pub name: String,
    pub path: Option<String>,
    pub source_branch: String,
    pub destination_branch: String,
    pub project: String,
    pub pipeline_id: Option<u32>,
}

impl ResolvedRepository {
    /// Empty branch names mean neither the repository nor the fleet configured one.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.source_branch.is_empty() {
            return Err(ConfigurationError::MissingBranch {
                repository: self.name.clone(),
                side: "source",
            });
        }
        if self.destination_branch.is_empty() {
            return Err(ConfigurationError::MissingBranch {
                repository: self.name.clone(),
                side: "destination",
            });
        }
        Ok(())
    }

    /// Like [`ResolvedRepository::validate`], plus the team project every
    /// remote call is scoped to.
    pub fn validate_remote(&self) -> Result<(), ConfigurationError> {
        self.validate()?;
        if self.project.is_empty() {
            return Err(ConfigurationError::MissingProject(self.name.clone()));
        }
        Ok(())
    }
}

fn or_default(value: &Option<String>, default: &str) -> String {
    match value {
        Some(value) if !value.is_empty() => value.clone(),
        _ => default.to_string(),
    }
}

/// Fill in a descriptor's missing branch and project overrides.
pub fn resolve(descriptor: &RepositoryDescriptor, fleet: &FleetConfig) -> ResolvedRepository {
    ResolvedRepository {
        name: descriptor.name.clone(),
        path: descriptor.path.clone().filter(|path| !path.is_empty()),
        source_branch: or_default(&descriptor.source_branch, &fleet.default_source_branch),
        destination_branch: or_default(
            &descriptor.destination_branch,
            &fleet.default_destination_branch,
        ),
        project: or_default(&descriptor.project, &fleet.default_project),
        pipeline_id: descriptor.pipeline_id,
    }
}

impl FleetConfig {
    pub fn find(&self, name: &str) -> Option<&RepositoryDescriptor> {
        self.repositories.iter().find(|repo| repo.name == name)
    }

    /// Resolve a repository by name; unknown names are a configuration error.
    pub fn resolve_by_name(&self, name: &str) -> Result<ResolvedRepository, ConfigurationError> {
        self.find(name)
            .map(|descriptor| resolve(descriptor, self))
            .ok_or_else(|| ConfigurationError::UnknownRepository(name.to_string()))
    }

    pub fn resolve_all(&self) -> Vec<ResolvedRepository> {
        self.repositories
            .iter()
            .map(|descriptor| resolve(descriptor, self))
            .collect()
    }
}
