//! Classification of `kubectl port-forward` output.
//!
//! kubectl has no structured status channel, so its log lines are the only
//! way to observe a tunnel's health.

use std::sync::LazyLock;

use regex::Regex;

static PERMISSION_DENIED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)permission denied").expect("valid regex"));

static PORT_IN_USE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)address already in use").expect("valid regex"));

static FORWARD_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(an error occurred forwarding|error forwarding port|lost connection to pod)")
        .expect("valid regex")
});

static ESTABLISHED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Forwarding from \S+ -> \d+").expect("valid regex"));

static HANDLED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Handling connection for \d+").expect("valid regex"));

/// What a single tunnel output line means
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogClass {
    /// The local listener is up
    Established,
    /// A client connection went through the tunnel
    ConnectionHandled,
    /// The tunnel lost its pod
    ForwardError,
    /// Another process owns the local port
    PortInUse,
    /// The local port may not be bound by this user
    PermissionDenied,
    /// Anything else
    Unclassified,
}

/// Classify one line of tunnel output.
///
/// Bind failures are checked first since kubectl wraps them in generic
/// error text.
pub fn classify_line(line: &str) -> LogClass {
    let line = line.trim();
    if PERMISSION_DENIED_RE.is_match(line) {
        LogClass::PermissionDenied
    } else if PORT_IN_USE_RE.is_match(line) {
        LogClass::PortInUse
    } else if FORWARD_ERROR_RE.is_match(line) {
        LogClass::ForwardError
    } else if ESTABLISHED_RE.is_match(line) {
        LogClass::Established
    } else if HANDLED_RE.is_match(line) {
        LogClass::ConnectionHandled
    } else {
        LogClass::Unclassified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_established() {
        assert_eq!(
            classify_line("Forwarding from 127.0.0.1:8080 -> 80"),
            LogClass::Established
        );
        assert_eq!(
            classify_line("Forwarding from [::1]:8080 -> 80"),
            LogClass::Established
        );
    }

    #[test]
    fn test_connection_handled() {
        assert_eq!(
            classify_line("Handling connection for 8080"),
            LogClass::ConnectionHandled
        );
    }

    #[test]
    fn test_forward_error() {
        assert_eq!(
            classify_line(
                "E1016 10:12:01.123456   4242 portforward.go:409] an error occurred forwarding 8080 -> 80: error forwarding port 80 to pod abc"
            ),
            LogClass::ForwardError
        );
        assert_eq!(
            classify_line("error: lost connection to pod"),
            LogClass::ForwardError
        );
    }

    #[test]
    fn test_port_in_use() {
        assert_eq!(
            classify_line(
                "Unable to listen on port 8080: Listeners failed to create with the following errors: [unable to create listener: Error listen tcp4 127.0.0.1:8080: bind: address already in use]"
            ),
            LogClass::PortInUse
        );
    }

    #[test]
    fn test_permission_denied() {
        assert_eq!(
            classify_line(
                "Unable to listen on port 80: Listeners failed to create with the following errors: [unable to create listener: Error listen tcp4 127.0.0.1:80: bind: permission denied]"
            ),
            LogClass::PermissionDenied
        );
    }

    #[test]
    fn test_unclassified() {
        assert_eq!(
            classify_line("error: unable to forward port because pod is not running"),
            LogClass::Unclassified
        );
        assert_eq!(classify_line(""), LogClass::Unclassified);
    }
}
