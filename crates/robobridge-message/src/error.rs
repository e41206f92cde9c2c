use crate::category::Category;

/// Errors that can occur while encoding or decoding bridge messages.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A category name that is not sensor, pose or image.
    #[error("unknown category '{0}'")]
    UnknownCategory(String),

    /// A payload was sent on a stream opened for another category.
    #[error("payload category {found} does not match stream category {expected}")]
    CategoryMismatch { expected: Category, found: Category },
}

pub type Result<T> = std::result::Result<T, MessageError>;
