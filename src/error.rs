//! Error types for dockflow

use std::path::PathBuf;
use thiserror::Error;

/// Failures while merging configuration into deployable servers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("No servers tagged '{environment}'")]
    NoMatchingServers { environment: String },

    #[error("Server '{server}' has no host (set it in servers.yml or via {override_key})")]
    UnresolvedHost { server: String, override_key: String },

    #[error("No manager declared for environment '{environment}'")]
    NoManagerReachable { environment: String },

    #[error("Server '{server}' not found in environment '{environment}'")]
    ServerNotFound { server: String, environment: String },

    #[error("No SSH credentials for server '{server}' (looked for {looked_for})")]
    MissingCredentials { server: String, looked_for: String },

    #[error("Failed to read SSH key {path:?} for server '{server}': {reason}")]
    KeyUnreadable {
        server: String,
        path: PathBuf,
        reason: String,
    },
}

/// Failures crossing the SSH boundary.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Authentication failed for {user}@{host}: {detail}")]
    AuthenticationFailed {
        host: String,
        user: String,
        detail: String,
    },

    #[error("Host unreachable: {host}: {detail}")]
    HostUnreachable { host: String, detail: String },

    #[error("Timed out after {secs}s on {host} running `{command}`")]
    Timeout {
        host: String,
        command: String,
        secs: u64,
    },

    #[error("`{command}` on {host} exited with {exit_code}: {stderr}")]
    CommandNonZeroExit {
        host: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Cancelled while running `{command}` on {host}")]
    Cancelled { host: String, command: String },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error talking to {host}: {source}")]
    Io {
        host: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConnectionError {
    /// True for errors where another manager may succeed.
    pub fn is_failover_candidate(&self) -> bool {
        matches!(
            self,
            ConnectionError::HostUnreachable { .. } | ConnectionError::Timeout { .. }
        )
    }
}

/// Deploy lock failures.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Environment '{environment}' is locked by {holder} since {acquired_at}")]
    AlreadyLocked {
        environment: String,
        holder: String,
        acquired_at: String,
    },

    #[error("Environment '{environment}' is locked by {holder}, not {requester}")]
    NotHolder {
        environment: String,
        holder: String,
        requester: String,
    },

    #[error("Environment '{environment}' is not locked")]
    NotLocked { environment: String },

    #[error("Invalid environment name '{0}'")]
    InvalidEnvironment(String),

    #[error("Corrupt lock record for '{environment}': {reason}")]
    Corrupt { environment: String, reason: String },

    #[error("Lock storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Per-image build failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("Build of {image} exited with {exit_code}")]
    BuildFailed { image: String, exit_code: i32 },

    #[error("Could not start build of {image}: {reason}")]
    Spawn { image: String, reason: String },

    #[error("Failed to write archive {path:?} for {image}: {reason}")]
    ArchiveFailed {
        image: String,
        path: PathBuf,
        reason: String,
    },
}

/// Operation registry conflicts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("A {0} operation is already running")]
    AlreadyRunning(String),
}

/// Anything that can stop a deploy.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    /// A non-manager node failed; switching managers would not help.
    #[error("Node '{server}' failed: {source}")]
    NodeFailed {
        server: String,
        #[source]
        source: ConnectionError,
    },

    #[error("Deploy cancelled")]
    Cancelled,

    #[error("Failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
