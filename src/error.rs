use thiserror::Error;

#[derive(Error, Debug)]
pub enum ColodError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Timeout(String),

    #[error("Channel got EOF")]
    Eof,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Qmp(String),

    #[error("Got interrupted while waiting for qmp event: {0}")]
    Interrupt(String),

    #[error("Pending actions")]
    PendingActions,

    #[error("{0}")]
    Fatal(String),
}

impl ColodError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ColodError::Timeout(_))
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, ColodError::Eof)
    }

    /// True for errors where QEMU itself answered with `{"error": ...}`.
    pub fn is_qmp(&self) -> bool {
        matches!(self, ColodError::Qmp(_))
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, ColodError::Interrupt(_))
    }
}

pub type Result<T> = std::result::Result<T, ColodError>;
