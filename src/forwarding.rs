use std::fmt;

use crate::{
    config::PodRegistry,
    error::{PodkeeperError, PodkeeperResult},
};

/// A resolved port forwarding request for one workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSpec {
    /// Workload name prefix
    pub name: String,
    /// Local port
    pub source_port: u16,
    /// Port inside the pod
    pub destination_port: u16,
    /// Namespace override for this pod
    pub namespace: Option<String>,
}

impl PodSpec {
    /// Parse or resolve a request token.
    ///
    /// Supported formats:
    /// - "name" (ports and namespace come from the pod lists)
    /// - "name:port" (destination defaults to the source port)
    /// - "name:port:destPort"
    ///
    /// Tokens with explicit ports bypass the pod lists entirely.
    pub fn resolve(token: &str, registry: &PodRegistry) -> PodkeeperResult<Self> {
        if token.contains(':') {
            return Self::parse(token);
        }

        let name = registry.resolve_name(token)?;
        let entry = registry
            .get(&name)
            .ok_or_else(|| PodkeeperError::NameUnresolved(token.to_string()))?;
        let source_port = entry
            .source_port()
            .ok_or_else(|| PodkeeperError::Config(format!("No port configured for {name}")))?;
        let destination_port = entry.destination_port().unwrap_or(source_port);

        Ok(PodSpec {
            namespace: entry.namespace().map(str::to_string),
            name,
            source_port,
            destination_port,
        })
    }

    /// Parse an explicit "name:port[:destPort]" token
    pub fn parse(token: &str) -> PodkeeperResult<Self> {
        let parts: Vec<&str> = token.split(':').collect();

        if parts.len() != 2 && parts.len() != 3 {
            return Err(PodkeeperError::Config(format!(
                "Invalid pod specification '{token}'. Expected format: name[:port[:destPort]]"
            )));
        }

        let name = parts[0];
        if name.is_empty() {
            return Err(PodkeeperError::Config(format!(
                "Missing pod name in '{token}'"
            )));
        }

        let source_port = parse_port(parts[1], token)?;
        let destination_port = match parts.get(2) {
            Some(part) => parse_port(part, token)?,
            None => source_port,
        };

        Ok(PodSpec {
            name: name.to_string(),
            source_port,
            destination_port,
            namespace: None,
        })
    }

    /// Port argument for `kubectl port-forward`
    pub fn port_arg(&self) -> String {
        if self.source_port == self.destination_port {
            self.source_port.to_string()
        } else {
            format!("{}:{}", self.source_port, self.destination_port)
        }
    }
}

impl fmt::Display for PodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} -> {})",
            self.name, self.source_port, self.destination_port
        )
    }
}

fn parse_port(part: &str, token: &str) -> PodkeeperResult<u16> {
    part.parse::<u16>().map_err(|_| {
        PodkeeperError::Config(format!("Invalid port '{part}' in pod specification '{token}'"))
    })
}

/// Build the list of pods to forward for this run.
///
/// Without positional tokens every project-local entry is forwarded.
/// Excluded names are dropped after resolution.
pub fn build_requests(
    tokens: &[String],
    excluded: &[String],
    registry: &PodRegistry,
) -> PodkeeperResult<Vec<PodSpec>> {
    let tokens: Vec<String> = if tokens.is_empty() {
        if registry.project_names().is_empty() {
            return Err(PodkeeperError::Config(
                "No pods given and no project pod list found".to_string(),
            ));
        }
        registry.project_names().to_vec()
    } else {
        tokens.to_vec()
    };

    let mut specs = Vec::with_capacity(tokens.len());
    for token in &tokens {
        let spec = PodSpec::resolve(token, registry)?;
        if excluded.iter().any(|name| *name == spec.name) {
            continue;
        }
        specs.push(spec);
    }

    if specs.is_empty() {
        return Err(PodkeeperError::Config(
            "Every requested pod is excluded".to_string(),
        ));
    }

    Ok(specs)
}
