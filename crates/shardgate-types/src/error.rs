use thiserror::Error;

/// Errors produced by type construction and parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("object name must not be empty")]
    EmptyObjectName,

    #[error("invalid object version '{0}': expected <epoch>'<counter>")]
    InvalidVersion(String),

    #[error("invalid placement group id '{0}': expected <pool>.<seed-hex>")]
    InvalidPgId(String),
}
