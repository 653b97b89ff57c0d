use thiserror::Error;

/// Core error types for hostwall
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Default route, interface or address could not be resolved
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Input validation failed (port range, family mismatch, ct-state mask, ...)
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Objects that cannot be combined (set key type vs. predicate family, interval specs
    /// on a discrete set, ...)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed literal (address, port, range, rate limit)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Network namespace could not be resolved, entered or restored
    #[error("Namespace error: {0}")]
    Namespace(String),

    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// The sink rejected a declaration or the flush
    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },
}

impl Error {
    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub(crate) fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            stderr: None,
            exit_code: None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Known nft/netlink failure patterns and their translations
pub struct TransactionHint;

impl TransactionHint {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run as root or grant CAP_NET_ADMIN")
                .with_suggestion("Entering a named network namespace also requires CAP_SYS_ADMIN");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("nftables is not installed or not found in PATH")
                .with_suggestion("Install nftables: sudo apt install nftables  (Debian/Ubuntu)")
                .with_suggestion("Or point HOSTWALL_NFT_COMMAND at the nft binary");
        }

        if lower.contains("set") && lower.contains("does not exist") {
            return ErrorTranslation::new("A rule references a set that is not installed")
                .with_suggestion("Apply the baseline policy before updating or injecting rules")
                .with_suggestion("Declare the set in the same transaction as the rule");
        }

        if lower.contains("table") && lower.contains("does not exist") {
            return ErrorTranslation::new("Firewall table does not exist")
                .with_suggestion("The policy may have been removed externally; run apply again");
        }

        if lower.contains("chain")
            && (lower.contains("does not exist") || lower.contains("not found"))
        {
            return ErrorTranslation::new("Firewall chain not found")
                .with_suggestion("Ensure the chain exists before adding rules to it");
        }

        if lower.contains("netns") || lower.contains("namespace") {
            return ErrorTranslation::new("Network namespace could not be entered")
                .with_suggestion("Check the namespace exists: ip netns list")
                .with_suggestion("Named namespaces live under /var/run/netns");
        }

        if lower.contains("netlink") {
            return ErrorTranslation::new("Communication error with kernel netlink interface")
                .with_suggestion("Check kernel modules: lsmod | grep nf_tables")
                .with_suggestion("Load nf_tables module: sudo modprobe nf_tables");
        }

        if lower.contains("resource busy") || lower.contains("device or resource busy") {
            return ErrorTranslation::new("Firewall resource is busy")
                .with_suggestion("Another process may be modifying nftables; retry the operation");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Verify nftables is working: sudo nft list ruleset")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
