use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefError {
    #[error("invalid repository name: {0:?}")]
    Name(String),
    #[error("invalid tag: {0:?}")]
    Tag(String),
    #[error("invalid registry host: {0:?}")]
    Registry(String),
    #[error("invalid digest: {0:?}")]
    Digest(String),
    #[error("invalid image reference: {0:?}")]
    Reference(String),
}

pub type Result<T> = std::result::Result<T, RefError>;
