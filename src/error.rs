use thiserror::Error;

#[derive(Debug, Error)]
pub enum GodmodeError {
    /// No response at all: connect failure, reset, timeout.
    #[error("transport error: {0}")]
    Transport(String),
    /// The remote answered with a non-2xx status.
    #[error("{message}")]
    Provider { status: u16, message: String },
    #[error("{0}")]
    Validation(String),
    /// The agent reply carried an `error:` command.
    #[error("agent reported an error: {0}")]
    RecoverableAgent(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T, E = GodmodeError> = std::result::Result<T, E>;

impl GodmodeError {
    pub fn provider(status: u16, message: impl Into<String>) -> Self {
        Self::Provider { status, message: message.into() }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Provider { status, .. } => Some(*status),
            Self::NotFound(_) => Some(404),
            Self::BadRequest(_) | Self::Validation(_) => Some(400),
            _ => None,
        }
    }

    /// Message shown to the user in a notification.
    pub fn user_message(&self) -> String {
        let mut msg = self.to_string();
        if msg.contains("quota") {
            msg.push_str("\nMake sure to add a payment method via the OpenAI dashboard.");
        }
        msg
    }
}

impl From<reqwest::Error> for GodmodeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Self::Decode(e.to_string());
        }
        match e.status() {
            Some(status) => Self::provider(status.as_u16(), e.to_string()),
            None => Self::Transport(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for GodmodeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<sqlx::Error> for GodmodeError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".into()),
            other => Self::Storage(other.to_string()),
        }
    }
}
