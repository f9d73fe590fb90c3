use regex::Regex;

use crate::error::{PodkeeperError, PodkeeperResult};

/// Raw `kubectl get pods` output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTable {
    text: String,
}

impl RawTable {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Lines whose leading token starts with `prefix`, header excluded
    fn lines_for<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.text.lines().filter(move |line| {
            let Some(first) = line.split_whitespace().next() else {
                return false;
            };
            first != "NAME" && first.starts_with(prefix)
        })
    }
}

/// Find the running instance of a workload.
///
/// Returns `Ok(None)` in silent mode when nothing is running, which is what
/// polling expects. Interactive callers get a descriptive error instead.
pub fn match_instance(
    table: &RawTable,
    prefix: &str,
    silent: bool,
) -> PodkeeperResult<Option<String>> {
    let escaped = regex::escape(prefix);
    let running = Regex::new(&format!(r"^\s*({escaped}\S*)\s.*\bRunning\b"))
        .map_err(|e| PodkeeperError::Query(e.to_string()))?;

    for line in table.lines_for(prefix) {
        if let Some(caps) = running.captures(line) {
            return Ok(Some(caps[1].to_string()));
        }
    }

    if silent {
        return Ok(None);
    }

    let phase = Regex::new(&format!(r"^\s*({escaped}\S*)\s+(\d+/\d+)\s+(\S+)"))
        .map_err(|e| PodkeeperError::Query(e.to_string()))?;

    for line in table.lines_for(prefix) {
        if let Some(caps) = phase.captures(line) {
            return Err(PodkeeperError::InstanceNotRunning {
                instance: caps[1].to_string(),
                ready: caps[2].to_string(),
                status: caps[3].to_string(),
            });
        }
    }

    Err(PodkeeperError::InstanceUnknown(prefix.to_string()))
}

/// Whether this exact instance is listed as Running
pub fn is_running(table: &RawTable, instance: &str) -> bool {
    table.text.lines().any(|line| {
        let mut fields = line.split_whitespace();
        fields.next() == Some(instance) && fields.any(|field| field == "Running")
    })
}
