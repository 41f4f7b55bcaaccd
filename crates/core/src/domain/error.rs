use serde::{Deserialize, Serialize};

/// ジョブに記録されるエラー種別（クライアントに見える）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InvalidAudioReference,
    ResourceExhausted,
    EngineUnavailable,
    Timeout,
    StoreUnavailable,
    Conflict,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::InvalidAudioReference => "invalid_audio_reference",
            Self::ResourceExhausted => "resource_exhausted",
            Self::EngineUnavailable => "engine_unavailable",
            Self::Timeout => "timeout",
            Self::StoreUnavailable => "store_unavailable",
            Self::Conflict => "conflict",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

/// Job.error に格納される構造化エラー
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }

    pub fn invalid_audio(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidAudioReference, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "job was cancelled")
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for JobFailure {}

/// 永続ストアのエラー
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record at {key}: {detail}")]
    Corrupt { key: String, detail: String },
}

impl StoreError {
    pub fn unavailable(detail: impl std::fmt::Display) -> Self {
        Self::Unavailable(detail.to_string())
    }
}

/// タスクキューのエラー
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
    #[error("queue backend failed: {0}")]
    Backend(String),
}

/// ジョブ投入 API が呼び出し側に返すエラー
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job already exists: {0}")]
    AlreadyExists(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidState {
        job_id: String,
        from: &'static str,
        to: &'static str,
    },
}

impl ManagerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// 呼び出し側に返す構造化エラー種別
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::Validation,
            Self::AlreadyExists(_) => ErrorKind::Conflict,
            Self::Store(_) => ErrorKind::StoreUnavailable,
            Self::Queue(_) => ErrorKind::Internal,
            Self::InvalidState { .. } => ErrorKind::Conflict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::InvalidAudioReference).unwrap(),
            "\"invalid_audio_reference\""
        );
        assert_eq!(
            serde_json::from_str::<ErrorKind>("\"resource_exhausted\"").unwrap(),
            ErrorKind::ResourceExhausted
        );
    }

    #[test]
    fn job_failure_display() {
        let f = JobFailure::validation("text is empty");
        assert_eq!(f.to_string(), "[validation] text is empty");
    }

    #[test]
    fn manager_error_kinds() {
        assert_eq!(
            ManagerError::validation("x").kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            ManagerError::from(StoreError::unavailable("db locked")).kind(),
            ErrorKind::StoreUnavailable
        );
    }
}
