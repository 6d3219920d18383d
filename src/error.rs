use thiserror::Error;

use crate::image_asset::AssetId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("file has no records")]
    EmptyInput,

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("image asset not found: id={0}")]
    NotFound(AssetId),

    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl Error {
    /// Errors caused by the uploaded content itself. The HTTP layer answers
    /// these with a 400 and never retries.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::EmptyInput | Error::MalformedInput(_))
    }

    /// Only origin/blob failures are worth retrying, and only by the caller
    /// of the whole request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SourceUnavailable(_))
    }
}
