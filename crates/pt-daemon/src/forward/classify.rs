//! Failure classification
//!
//! Collaborator errors arrive as free text. This module is the single place
//! that text is pattern-matched; everything else works with [`FailureKind`].
//! The patterns are best-effort and follow kubectl / client-go wording, so
//! they may need updating when that wording changes. Text that matches
//! nothing is `Other`, which is retried like a transient failure.

use std::fmt;

/// Closed set of tunnel failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Local port bound by something else
    PortUnavailable,
    /// The target pod no longer exists
    PodNotFound,
    /// Stream ended by a network blip or server-side reset
    StreamTransient,
    /// Known stream-setup quirk that leaves the stream wedged
    RecoverableStreamBug,
    /// Unrecognized
    Other,
}

impl FailureKind {
    /// Retrying is known to be futile
    pub fn is_terminal(self) -> bool {
        matches!(self, FailureKind::PortUnavailable | FailureKind::PodNotFound)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::PortUnavailable => "port unavailable",
            FailureKind::PodNotFound => "pod not found",
            FailureKind::StreamTransient => "transient stream failure",
            FailureKind::RecoverableStreamBug => "recoverable stream bug",
            FailureKind::Other => "other",
        };
        f.write_str(name)
    }
}

const STREAM_BUG: &str = "error creating error stream for port";

const PORT_UNAVAILABLE: &[&str] = &[
    "unable to listen on any of the requested ports",
    "unable to listen on port",
    "address already in use",
];

const TRANSIENT: &[&str] = &[
    "lost connection to pod",
    "connection reset by peer",
    "broken pipe",
    "unexpected eof",
    "i/o timeout",
    "connection refused",
    "an error occurred forwarding",
];

/// Map collaborator error text to a failure class
pub fn classify(message: &str) -> FailureKind {
    let text = message.to_ascii_lowercase();

    if text.contains(STREAM_BUG) {
        return FailureKind::RecoverableStreamBug;
    }
    if PORT_UNAVAILABLE.iter().any(|p| text.contains(p)) {
        return FailureKind::PortUnavailable;
    }
    if text.contains("not found") && (text.contains("pods \"") || text.contains("pod ")) {
        return FailureKind::PodNotFound;
    }
    if TRANSIENT.iter().any(|p| text.contains(p)) {
        return FailureKind::StreamTransient;
    }
    FailureKind::Other
}

/// Whether a stream-bug line refers to this tunnel's port pair
///
/// client-go prints the pair as `L -> R`; lines from a different tunnel
/// sharing the process must not restart this one. Both numbers are compared
/// whole, so `18080 -> 80` is not `8080 -> 80`.
pub fn mentions_ports(line: &str, local_port: u16, remote_port: u16) -> bool {
    line.match_indices("->").any(|(idx, arrow)| {
        let before = line[..idx].trim_end();
        let after = line[idx + arrow.len()..].trim_start();

        let local = &before[before.trim_end_matches(|c: char| c.is_ascii_digit()).len()..];
        let remote_end = after
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(after.len());

        local.parse::<u16>().ok() == Some(local_port)
            && after[..remote_end].parse::<u16>().ok() == Some(remote_port)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classes() {
        assert_eq!(
            classify("Unable to listen on port 8080: Listeners failed to create with the following errors: [unable to create listener: Error listen tcp4 127.0.0.1:8080: bind: address already in use]"),
            FailureKind::PortUnavailable
        );
        assert_eq!(
            classify("error: unable to listen on any of the requested ports: [{8080 80}]"),
            FailureKind::PortUnavailable
        );
        assert_eq!(
            classify("Error from server (NotFound): pods \"nginx-aaa\" not found"),
            FailureKind::PodNotFound
        );
        assert_eq!(classify("pod nginx-aaa not found"), FailureKind::PodNotFound);
        assert!(FailureKind::PortUnavailable.is_terminal());
        assert!(FailureKind::PodNotFound.is_terminal());
    }

    #[test]
    fn test_retryable_classes() {
        assert_eq!(
            classify("E0101 portforward.go:400] lost connection to pod"),
            FailureKind::StreamTransient
        );
        assert_eq!(
            classify("read tcp 10.0.0.1:50000->10.0.0.2:443: read: connection reset by peer"),
            FailureKind::StreamTransient
        );
        assert_eq!(
            classify("an error occurred forwarding 8080 -> 80: error forwarding port 80 to pod abc, uid : exit status 1"),
            FailureKind::StreamTransient
        );
        assert_eq!(classify("something nobody has seen before"), FailureKind::Other);
        assert!(!FailureKind::StreamTransient.is_terminal());
        assert!(!FailureKind::Other.is_terminal());
    }

    #[test]
    fn test_stream_bug_wins() {
        let line = "E0101 portforward.go:234] error creating error stream for port 8080 -> 80: Timeout occurred";
        assert_eq!(classify(line), FailureKind::RecoverableStreamBug);
        assert!(!FailureKind::RecoverableStreamBug.is_terminal());
    }

    #[test]
    fn test_mentions_ports() {
        let line = "error creating error stream for port 8080 -> 80: Timeout occurred";
        assert!(mentions_ports(line, 8080, 80));
        assert!(!mentions_ports(line, 9090, 80));
        assert!(!mentions_ports(line, 8080, 8));
    }

    #[test]
    fn test_mentions_ports_compares_whole_numbers() {
        let longer_local = "error creating error stream for port 18080 -> 80: Timeout occurred";
        assert!(!mentions_ports(longer_local, 8080, 80));
        assert!(mentions_ports(longer_local, 18080, 80));

        let longer_remote = "error creating error stream for port 8080 -> 800: Timeout occurred";
        assert!(!mentions_ports(longer_remote, 8080, 80));
        assert!(mentions_ports(longer_remote, 8080, 800));

        assert!(mentions_ports("port 8080->80", 8080, 80));
        assert!(!mentions_ports("no arrow here 8080 80", 8080, 80));
        assert!(!mentions_ports("-> 80 at the start", 8080, 80));
    }
}
