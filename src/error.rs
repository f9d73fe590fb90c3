use thiserror::Error;

/// Result type alias for podkeeper operations
pub type PodkeeperResult<T> = Result<T, PodkeeperError>;

/// Error types for the podkeeper library
#[derive(Error, Debug)]
pub enum PodkeeperError {
    /// Configuration related errors (pod lists, CLI values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The workload exists but is not in the Running phase
    #[error("Pod {instance} is not running (ready {ready}, status {status})")]
    InstanceNotRunning {
        instance: String,
        ready: String,
        status: String,
    },

    /// No workload matches the given name prefix
    #[error("No pod found matching '{0}'")]
    InstanceUnknown(String),

    /// A short name matches several configured pods
    #[error("'{name}' is ambiguous, it matches: {}", .candidates.join(", "))]
    NameAmbiguous {
        name: String,
        candidates: Vec<String>,
    },

    /// A short name matches no configured pod
    #[error("'{0}' does not match any configured pod")]
    NameUnresolved(String),

    /// Another process already owns the local port
    #[error("Port {port} is already in use, skipping {pod}")]
    PortConflict { pod: String, port: u16 },

    /// The tunnel is not allowed to bind its local port
    #[error("Permission denied while forwarding {pod}: {line}")]
    PermissionDenied { pod: String, line: String },

    /// The pod did not come back within the retry budget
    #[error("Gave up on {pod} after {attempts} attempts")]
    RetryExhausted { pod: String, attempts: u32 },

    /// The tunnel printed something unexpected before it was established
    #[error("Port forwarding for {pod} failed to start: {line}")]
    UnclassifiedStartupFailure { pod: String, line: String },

    /// The cluster query failed for a reason other than connectivity
    #[error("Cluster query failed: {0}")]
    Query(String),

    /// The external tunnel process could not be started
    #[error("Failed to spawn tunnel: {0}")]
    Spawn(String),
}

impl PodkeeperError {
    /// Process exit code for a run that ends with this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PodkeeperError::Config(_)
            | PodkeeperError::InstanceNotRunning { .. }
            | PodkeeperError::InstanceUnknown(_)
            | PodkeeperError::NameAmbiguous { .. }
            | PodkeeperError::NameUnresolved(_) => 2,
            PodkeeperError::PermissionDenied { .. } => 3,
            PodkeeperError::RetryExhausted { .. } => 4,
            PodkeeperError::UnclassifiedStartupFailure { .. } => 5,
            PodkeeperError::PortConflict { .. }
            | PodkeeperError::Query(_)
            | PodkeeperError::Spawn(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_lists_candidates() {
        let err = PodkeeperError::NameAmbiguous {
            name: "a".to_string(),
            candidates: vec!["api".to_string(), "auth".to_string()],
        };
        assert_eq!(err.to_string(), "'a' is ambiguous, it matches: api, auth");
    }

    #[test]
    fn test_exit_codes_are_distinct_per_fatal_reason() {
        let permission = PodkeeperError::PermissionDenied {
            pod: "web".to_string(),
            line: String::new(),
        };
        let exhausted = PodkeeperError::RetryExhausted {
            pod: "web".to_string(),
            attempts: 20,
        };
        let startup = PodkeeperError::UnclassifiedStartupFailure {
            pod: "web".to_string(),
            line: String::new(),
        };

        assert_eq!(permission.exit_code(), 3);
        assert_eq!(exhausted.exit_code(), 4);
        assert_eq!(startup.exit_code(), 5);
        assert_eq!(PodkeeperError::NameUnresolved("x".into()).exit_code(), 2);
    }
}
