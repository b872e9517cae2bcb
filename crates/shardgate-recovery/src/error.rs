use thiserror::Error;

/// Errors produced while setting up or inspecting the recovery core.
///
/// Waits on the gate itself resolve with [`shardgate_pg::Interrupted`]; this
/// type covers everything around them.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to render configuration: {0}")]
    ConfigRender(#[from] toml::ser::Error),
}

/// Convenience alias used throughout the recovery crate.
pub type RecoveryResult<T> = Result<T, RecoveryError>;
