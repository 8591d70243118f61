use thiserror::Error;

/// Failure of a single action, as surfaced on the action record.
///
/// Scheduler-level problems (unknown id, action not ready) are not part of
/// this taxonomy; they are rejections of the publish request itself.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("cannot resolve {property} reference '{value}' to an entity id")]
    UnresolvedReference { property: String, value: String },

    #[error("remote rejected the request [{code}]: {info}")]
    RemoteRejection { code: String, info: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ActionError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// True when retrying without changing the input cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Precondition(_) | Self::UnresolvedReference { .. }
        )
    }
}

pub type ActionResult<T> = std::result::Result<T, ActionError>;
