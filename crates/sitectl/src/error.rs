#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Infra(#[from] sc_infra::Error),

    #[error("{0}")]
    Usage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
