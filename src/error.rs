//! Error taxonomy for the subscription sync core
//!
//! Per-item failures (a single URI that fails to parse, a single profile in
//! a sweep) are collected and never abort the surrounding batch. Operation
//! level failures are returned as typed results so calling code can render
//! them without a crash. Nothing here retries automatically.

use thiserror::Error;

/// Failure to parse a single proxy-server URI.
///
/// Always non-fatal to the caller: a subscription with N URIs of which M
/// fail still yields the N-M valid servers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unsupported URI scheme: {0}")]
    UnsupportedScheme(String),

    #[error("missing or invalid port")]
    InvalidPort,

    #[error("malformed credential: {0}")]
    MalformedCredential(String),

    #[error("malformed URI: {0}")]
    MalformedUri(String),
}

/// Failure to decode a whole subscription document.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("subscription body is not valid UTF-8")]
    InvalidUtf8,

    #[error("subscription body is empty")]
    EmptyBody,
}

/// Failure to generate an engine configuration for a stored server.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The server's protocol has no config branch. Such servers are still
    /// stored and synced, just not connectable yet.
    #[error("no engine configuration available for protocol '{0}'")]
    UnsupportedProtocol(String),
}

/// Failure in the underlying persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("profile not found: {0}")]
    ProfileNotFound(uuid::Uuid),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to serialize server config: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure in the platform-backed secret store collaborator.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret store unavailable: {0}")]
    Unavailable(String),

    #[error("ciphertext is corrupt or undecryptable")]
    Corrupt,
}

/// Failure surfaced by the HTTP subscription fetcher collaborator.
#[derive(Debug, Error)]
#[error("failed to fetch subscription from {url}: {message}")]
pub struct FetchError {
    pub url: String,
    pub message: String,
}

/// Failure of a sync-engine operation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("profile not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("profile {0} is not a remote profile")]
    NotRemote(uuid::Uuid),

    #[error("profile {0} has no stored subscription URL")]
    NoUrlStored(uuid::Uuid),

    #[error("subscription yielded no parseable servers")]
    NoServersFound,

    #[error(transparent)]
    Network(#[from] FetchError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
