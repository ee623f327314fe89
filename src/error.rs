#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    RcgenError(#[from] rcgen::Error),

    #[error(transparent)]
    TlsError(#[from] tokio_rustls::rustls::Error),

    #[error(transparent)]
    JoinError(#[from] tokio::task::JoinError),

    #[error(transparent)]
    LogDirectiveError(#[from] tracing_subscriber::filter::ParseError),

    #[error(transparent)]
    SubscriberError(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("invalid configuration: {0}")]
    ConfigError(String),
}
