use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Unrecognized input at byte {position} in filter expression")]
    Lex { position: usize },

    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Unknown identifier {name:?} (only version fields are addressable)")]
    UnknownIdentifier { name: String },

    #[error("Type error: {message}")]
    Type { message: String },

    #[error("Cannot parse {text:?} as a date")]
    BadDate { text: String },
}

impl FilterError {
    pub fn parse(message: impl Into<String>) -> Self {
        FilterError::Parse {
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        FilterError::Type {
            message: message.into(),
        }
    }
}
