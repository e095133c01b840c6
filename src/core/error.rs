use crate::core::store::StoreError;
use thiserror::Error;

/// Core error types for zonewall
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Namespace descriptor missing or the netlink socket could not be opened
    #[error("Connection error (namespace {netns}): {message}")]
    Connection { netns: String, message: String },

    /// A queued add/delete was rejected by the kernel
    #[error("Kernel rejected {operation}: {source}")]
    KernelCommit {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// An installed rule could not be resolved to exactly one rule kind
    #[error("Unclassifiable rule in {chain} (handle {handle:?}): {reason}")]
    ClassificationAmbiguity {
        chain: String,
        handle: Option<u64>,
        reason: String,
    },

    /// Malformed CIDR
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Rule builder called with something it cannot encode
    #[error("Invalid rule parameter: {0}")]
    InvalidRuleParameter(String),

    /// `open_connection` takes at most one namespace name
    #[error("Expected at most one namespace name, got {0}")]
    InvalidArgumentCount(usize),

    /// A zone is in the desired state but has no observed status yet
    #[error("Zone {0} has no observed status yet")]
    InconsistentSpecStatus(String),

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Spec/status persistence failed
    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether the next scheduled pass may succeed without operator action.
    ///
    /// Connection and commit failures leave the ruleset partially converged
    /// and are healed by re-running the pass. Bad input is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::Connection { .. }
            | Error::KernelCommit { .. }
            | Error::InconsistentSpecStatus(_)
            | Error::Store(_) => true,
            Error::Serialization(_)
            | Error::ClassificationAmbiguity { .. }
            | Error::InvalidAddress(_)
            | Error::InvalidRuleParameter(_)
            | Error::InvalidArgumentCount(_)
            | Error::Validation { .. }
            | Error::Internal(_) => false,
        }
    }

    /// Raw errno for kernel and socket failures
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::KernelCommit { source, .. } | Error::Io(source) => source.raw_os_error(),
            _ => None,
        }
    }

    /// Operator-facing explanation with suggestions
    pub fn translate(&self) -> ErrorTranslation {
        match self {
            Error::KernelCommit { .. } | Error::Io(_) => match self.errno() {
                Some(errno) => KernelErrorPattern::match_errno(errno),
                None => KernelErrorPattern::match_error(&self.to_string()),
            },
            Error::Connection { netns, .. } => {
                ErrorTranslation::new(format!("Cannot reach namespace '{netns}'"))
                    .with_suggestion("List namespaces: ip netns list")
                    .with_suggestion("Create it first: ip netns add <name>")
                    .with_suggestion("Entering a namespace requires CAP_SYS_ADMIN")
            }
            other => KernelErrorPattern::match_error(&other.to_string()),
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Known kernel failure modes and their translations
pub struct KernelErrorPattern;

impl KernelErrorPattern {
    /// Translates a netlink error code (positive errno).
    pub fn match_errno(errno: i32) -> ErrorTranslation {
        match errno {
            libc::EPERM | libc::EACCES => {
                ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                    .with_suggestion("Run zonewall as root")
                    .with_suggestion("Or grant CAP_NET_ADMIN to the binary")
                    .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Quick_reference-nftables_in_10_minutes")
            }
            libc::ENOENT => ErrorTranslation::new("Firewall table, chain or rule does not exist")
                .with_suggestion("The 'filter' table may not have been bootstrapped yet")
                .with_suggestion("Run: zonewall bootstrap --netns <name>")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Configuring_chains"),
            libc::EEXIST => ErrorTranslation::new("Conflicting firewall table or chain")
                .with_suggestion("An object with the same name already exists")
                .with_suggestion("Bootstrap resets the table, run it again to start clean"),
            libc::EBUSY => ErrorTranslation::new("Firewall resource is busy")
                .with_suggestion("Another process may be modifying nftables")
                .with_suggestion("Chains referenced by jump rules cannot be deleted"),
            libc::EINVAL | libc::EOPNOTSUPP => {
                ErrorTranslation::new("Kernel rejected the rule encoding")
                    .with_suggestion("The kernel may be too old for one of the expressions")
                    .with_suggestion("Check kernel modules: lsmod | grep nft_")
                    .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting")
            }
            libc::EPROTONOSUPPORT | libc::EAFNOSUPPORT => {
                ErrorTranslation::new("nf_tables is not available in this kernel")
                    .with_suggestion("Load nf_tables module: sudo modprobe nf_tables")
                    .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting")
            }
            libc::ENOBUFS | libc::ENOMEM => ErrorTranslation::new("Kernel ran out of memory")
                .with_suggestion("The batch was too large or the system is under pressure")
                .with_suggestion("Try again when the system is less busy"),
            _ => ErrorTranslation::new(format!(
                "Firewall error: {}",
                std::io::Error::from_raw_os_error(errno)
            ))
            .with_suggestion("Verify nftables is working: sudo nft list ruleset")
            .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting"),
        }
    }

    /// Matches an error message against known patterns.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return Self::match_errno(libc::EPERM);
        }

        if lower.contains("invalid address") {
            return ErrorTranslation::new("Invalid IP prefix in allow-list")
                .with_suggestion("Use CIDR notation: 192.168.1.0/24 or 2001:db8::/64")
                .with_help("https://en.wikipedia.org/wiki/Classless_Inter-Domain_Routing");
        }

        if lower.contains("interface") {
            return ErrorTranslation::new("Network interface name is invalid")
                .with_suggestion("Interface names are case-sensitive and max 15 chars")
                .with_suggestion("Check available interfaces: ip link show");
        }

        if lower.contains("unclassifiable rule") {
            return ErrorTranslation::new("A rule not written by zonewall was found")
                .with_suggestion("Inspect the chain: nft -a list table inet filter")
                .with_suggestion("Re-run bootstrap to reset the table");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_error(errno: i32) -> Error {
        Error::KernelCommit {
            operation: "add rule".to_string(),
            source: std::io::Error::from_raw_os_error(errno),
        }
    }

    #[test]
    fn test_permission_errno_translation() {
        let translation = commit_error(libc::EPERM).translate();
        assert!(translation.user_message.contains("permissions"));
        assert!(
            translation
                .suggestions
                .iter()
                .any(|s| s.contains("CAP_NET_ADMIN"))
        );
        assert!(translation.help_url.is_some());
    }

    #[test]
    fn test_missing_table_points_at_bootstrap() {
        let translation = KernelErrorPattern::match_errno(libc::ENOENT);
        assert!(translation.suggestions.iter().any(|s| s.contains("bootstrap")));
    }

    #[test]
    fn test_message_fallback_for_invalid_address() {
        let translation = Error::InvalidAddress("10.0.0.0/33".into()).translate();
        assert!(translation.user_message.contains("prefix"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(commit_error(libc::EBUSY).is_retryable());
        assert!(
            Error::Connection {
                netns: "r1".into(),
                message: "gone".into()
            }
            .is_retryable()
        );
        assert!(!Error::InvalidRuleParameter("ip version 5".into()).is_retryable());
        assert!(!Error::InvalidArgumentCount(2).is_retryable());
    }

    #[test]
    fn test_errno_exposed_for_commit_errors() {
        assert_eq!(commit_error(libc::EEXIST).errno(), Some(libc::EEXIST));
        assert_eq!(Error::Internal("x".into()).errno(), None);
    }
}
