use benji_engine::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NbdError {
    #[error("Protocol violation: {reason}")]
    Protocol { reason: String },

    #[error("Unknown export {name:?}")]
    UnknownExport { name: String },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Socket error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl NbdError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        NbdError::Protocol {
            reason: reason.into(),
        }
    }

    /// A peer that simply went away mid-negotiation or mid-transmission.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            NbdError::Io { source }
                if matches!(
                    source.kind(),
                    std::io::ErrorKind::UnexpectedEof
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::BrokenPipe
                )
        )
    }
}
