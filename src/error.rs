use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorCode {
    InvalidConfig,
    Detached,
    Unavailable,
    Source,
    PageOutOfRange,
    Validation,
}

impl SyncErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncErrorCode::InvalidConfig => "invalid_config",
            SyncErrorCode::Detached => "detached",
            SyncErrorCode::Unavailable => "unavailable",
            SyncErrorCode::Source => "source",
            SyncErrorCode::PageOutOfRange => "page_out_of_range",
            SyncErrorCode::Validation => "validation",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("table '{table_id}' subscription is detached")]
    Detached { table_id: String },
    /// The presentation layer is not mounted. Never surfaced past the applier.
    #[error("presentation unavailable: {message}")]
    Unavailable { message: String },
    /// Backend page or count query failed; the calling context decides how to surface it.
    #[error("page source error: {message}")]
    Source { message: String },
    #[error("page {page} out of range (total_pages={total_pages})")]
    PageOutOfRange { page: usize, total_pages: usize },
    #[error("validation error: {0}")]
    Validation(String),
}

impl SyncError {
    pub fn code(&self) -> SyncErrorCode {
        match self {
            SyncError::InvalidConfig { .. } => SyncErrorCode::InvalidConfig,
            SyncError::Detached { .. } => SyncErrorCode::Detached,
            SyncError::Unavailable { .. } => SyncErrorCode::Unavailable,
            SyncError::Source { .. } => SyncErrorCode::Source,
            SyncError::PageOutOfRange { .. } => SyncErrorCode::PageOutOfRange,
            SyncError::Validation(_) => SyncErrorCode::Validation,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn source_error(message: impl Into<String>) -> Self {
        SyncError::Source {
            message: message.into(),
        }
    }
}
