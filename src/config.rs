use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{PodkeeperError, PodkeeperResult},
    health::RetryPolicy,
};

/// File name of the user-global pod list, looked up in the home directory
pub const USER_CONFIG_FILE: &str = ".podkeeper.json";
/// File name of the project-local pod list, looked up in the working directory
pub const PROJECT_CONFIG_FILE: &str = "podkeeper.json";

/// Immutable settings for one run, built once at startup
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// kubectl binary to invoke
    pub kubectl: PathBuf,
    /// Explicit kubeconfig passed to every kubectl invocation
    pub kubeconfig: Option<PathBuf>,
    /// Namespace used when a pod does not name its own
    pub namespace: Option<String>,
    /// Delay between reconciliation ticks
    pub health_interval: Duration,
    /// Reconnection timing and budget
    pub retry: RetryPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            kubectl: PathBuf::from("kubectl"),
            kubeconfig: None,
            namespace: None,
            health_interval: Duration::from_millis(5000),
            retry: RetryPolicy::default(),
        }
    }
}

/// One entry of a pod list: a bare port or an explicit mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortEntry {
    /// Same port locally and in the pod
    Port(u16),
    /// Explicit source/destination ports and namespace
    Detailed {
        #[serde(default)]
        from: Option<u16>,
        #[serde(default)]
        to: Option<u16>,
        #[serde(default)]
        namespace: Option<String>,
    },
}

impl PortEntry {
    /// Local port, if the entry names one
    pub fn source_port(&self) -> Option<u16> {
        match self {
            PortEntry::Port(port) => Some(*port),
            PortEntry::Detailed { from, .. } => *from,
        }
    }

    /// Pod port, defaulting to the local one
    pub fn destination_port(&self) -> Option<u16> {
        match self {
            PortEntry::Port(port) => Some(*port),
            PortEntry::Detailed { from, to, .. } => to.or(*from),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            PortEntry::Port(_) => None,
            PortEntry::Detailed { namespace, .. } => namespace.as_deref(),
        }
    }
}

/// Pod lists merged from the user-global and project-local files
#[derive(Debug, Clone, Default)]
pub struct PodRegistry {
    entries: IndexMap<String, PortEntry>,
    project_names: Vec<String>,
}

impl PodRegistry {
    /// Merge two pod lists; a project entry replaces the user entry of the same name
    pub fn merge(user: IndexMap<String, PortEntry>, project: IndexMap<String, PortEntry>) -> Self {
        let project_names = project.keys().cloned().collect();
        let mut entries = user;
        for (name, entry) in project {
            entries.insert(name, entry);
        }
        Self {
            entries,
            project_names,
        }
    }

    /// Load and merge both pod list files. Missing files count as empty lists.
    pub fn load(user_path: Option<&Path>, project_path: &Path) -> PodkeeperResult<Self> {
        let user = match user_path {
            Some(path) => read_pod_list(path)?,
            None => IndexMap::new(),
        };
        let project = read_pod_list(project_path)?;
        Ok(Self::merge(user, project))
    }

    pub fn get(&self, name: &str) -> Option<&PortEntry> {
        self.entries.get(name)
    }

    /// Names declared by the project-local file, in file order
    pub fn project_names(&self) -> &[String] {
        &self.project_names
    }

    /// Resolve a short name to a configured pod name.
    ///
    /// An exact match wins. Otherwise the name is treated as a
    /// case-insensitive prefix that must select exactly one entry.
    pub fn resolve_name(&self, short: &str) -> PodkeeperResult<String> {
        if self.entries.contains_key(short) {
            return Ok(short.to_string());
        }

        let needle = short.to_lowercase();
        let candidates: Vec<String> = self
            .entries
            .keys()
            .filter(|name| name.to_lowercase().starts_with(&needle))
            .cloned()
            .collect();

        match candidates.len() {
            0 => Err(PodkeeperError::NameUnresolved(short.to_string())),
            1 => Ok(candidates.into_iter().next().unwrap_or_default()),
            _ => Err(PodkeeperError::NameAmbiguous {
                name: short.to_string(),
                candidates,
            }),
        }
    }
}

/// Read one pod list file
fn read_pod_list(path: &Path) -> PodkeeperResult<IndexMap<String, PortEntry>> {
    if !path.exists() {
        debug!("Pod list {} not found, skipping", path.display());
        return Ok(IndexMap::new());
    }

    let content = std::fs::read_to_string(path).map_err(|e| {
        PodkeeperError::Config(format!("Failed to read {}: {e}", path.display()))
    })?;

    serde_json::from_str(&content)
        .map_err(|e| PodkeeperError::Config(format!("Failed to parse {}: {e}", path.display())))
}

/// Default location of the user-global pod list
pub fn default_user_config() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(USER_CONFIG_FILE))
}

/// Default kubeconfig used when `--kubeconfig` is given without a path
pub fn default_kubeconfig() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("KUBECONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".kube").join("config"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(names: &[&str]) -> PodRegistry {
        let project = names
            .iter()
            .map(|name| (name.to_string(), PortEntry::Port(80)))
            .collect();
        PodRegistry::merge(IndexMap::new(), project)
    }

    #[test]
    fn test_parse_bare_and_detailed_entries() {
        let list: IndexMap<String, PortEntry> = serde_json::from_str(
            r#"{"web": 8080, "db": {"from": 5432, "to": 5433, "namespace": "staging"}}"#,
        )
        .unwrap();

        assert_eq!(list["web"], PortEntry::Port(8080));
        assert_eq!(list["db"].source_port(), Some(5432));
        assert_eq!(list["db"].destination_port(), Some(5433));
        assert_eq!(list["db"].namespace(), Some("staging"));
        assert_eq!(list.keys().collect::<Vec<_>>(), vec!["web", "db"]);
    }

    #[test]
    fn test_detailed_entry_defaults_destination_to_source() {
        let entry: PortEntry = serde_json::from_str(r#"{"from": 3000}"#).unwrap();
        assert_eq!(entry.destination_port(), Some(3000));

        let empty: PortEntry = serde_json::from_str(r#"{"namespace": "x"}"#).unwrap();
        assert_eq!(empty.source_port(), None);
    }

    #[test]
    fn test_project_entry_overrides_user_entry() {
        let user: IndexMap<String, PortEntry> = serde_json::from_str(
            r#"{"db": {"from": 1, "to": 2, "namespace": "prod"}, "cache": 6379}"#,
        )
        .unwrap();
        let project: IndexMap<String, PortEntry> = serde_json::from_str(r#"{"db": 5432}"#).unwrap();

        let merged = PodRegistry::merge(user, project);

        assert_eq!(merged.get("db"), Some(&PortEntry::Port(5432)));
        assert_eq!(merged.get("cache"), Some(&PortEntry::Port(6379)));
        assert_eq!(merged.project_names(), ["db".to_string()]);
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join(USER_CONFIG_FILE);
        let project = dir.path().join(PROJECT_CONFIG_FILE);
        std::fs::write(&user, r#"{"web": 80, "api": 3000}"#).unwrap();
        std::fs::write(&project, r#"{"web": 8080}"#).unwrap();

        let registry = PodRegistry::load(Some(&user), &project).unwrap();

        assert_eq!(registry.get("web"), Some(&PortEntry::Port(8080)));
        assert_eq!(registry.get("api"), Some(&PortEntry::Port(3000)));
    }

    #[test]
    fn test_missing_files_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PodRegistry::load(None, &dir.path().join("nope.json")).unwrap();
        assert!(registry.project_names().is_empty());
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join(PROJECT_CONFIG_FILE);
        std::fs::write(&project, r#"{"web": 99999}"#).unwrap();

        let result = PodRegistry::load(None, &project);
        assert!(matches!(result, Err(PodkeeperError::Config(_))));
    }

    #[test]
    fn test_resolve_exact_match_wins() {
        let registry = registry(&["api", "api-gateway"]);
        assert_eq!(registry.resolve_name("api").unwrap(), "api");
    }

    #[test]
    fn test_resolve_unique_prefix() {
        let registry = registry(&["api", "web", "worker"]);
        assert_eq!(registry.resolve_name("a").unwrap(), "api");
        assert_eq!(registry.resolve_name("WE").unwrap(), "web");
    }

    #[test]
    fn test_resolve_ambiguous_prefix() {
        let registry = registry(&["api", "web", "worker"]);
        match registry.resolve_name("w") {
            Err(PodkeeperError::NameAmbiguous { candidates, .. }) => {
                assert_eq!(candidates, vec!["web", "worker"]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = registry(&["api"]);
        assert!(matches!(
            registry.resolve_name("db"),
            Err(PodkeeperError::NameUnresolved(_))
        ));
    }
}
