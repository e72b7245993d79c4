//! Error types for the mail sorter.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rule store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to read rules from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse rules from {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Rule {user}: {source_folder} -> {target_folder} already exists")]
    Duplicate {
        user: String,
        source_folder: String,
        target_folder: String,
    },

    #[error("Rule {id} not found")]
    NotFound { id: String },
}

/// Mailbox (IMAP) errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Authentication failed for {user} on {server}: {reason}")]
    Auth {
        user: String,
        server: String,
        reason: String,
    },

    #[error("Protocol error during {command}: {reason}")]
    Protocol { command: String, reason: String },

    #[error("{0}: malformed email address")]
    MalformedAddress(String),

    #[error("Mailbox for {user} is not connected")]
    NotConnected { user: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MailboxError {
    pub(crate) fn protocol(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

/// Worker task errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {name} is already running")]
    DuplicateName { name: String },

    #[error("Task {name} was never started")]
    NotStarted { name: String },

    #[error("Task {name} panicked: {reason}")]
    Panicked { name: String, reason: String },

    #[error("Task {name} hung for {elapsed:?}")]
    Hung { name: String, elapsed: Duration },
}
