use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Encoding Error - {0}")]
    Encoding(String),

    #[error("Store Error - {0}")]
    Store(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Watermark Error - {0}")]
    Watermark(String),

    #[error("Forwarder Error - {0}")]
    Forwarder(String),
}
