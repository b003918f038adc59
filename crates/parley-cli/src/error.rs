//! Error types for the `parley` binary.

/// Top-level error for the `parley` binary.
///
/// Each variant wraps a specific subsystem error, so `run` can propagate
/// with `?`.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Endpoint configuration could not be loaded.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: parley_store::ConfigError,
    },

    /// The domain file could not be loaded.
    #[error("domain error: {source}")]
    Domain {
        /// The underlying domain error.
        #[from]
        source: parley_types::DomainError,
    },

    /// A tracker store or event broker operation failed.
    #[error("{source}")]
    Store {
        /// The underlying store error.
        #[from]
        source: parley_store::StoreError,
    },

    /// A tracker could not be rendered.
    #[error("output error: {source}")]
    Output {
        /// The underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}
