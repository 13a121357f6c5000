use std::fmt;

/// The two external connections the bridge depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Cloud,
    Bus,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Cloud => f.write_str("cloud"),
            Channel::Bus => f.write_str("bus"),
        }
    }
}

/// Errors raised by the synchronization engine and its channels.
///
/// Everything except [`BridgeError::InvalidCommand`] is fatal: it unwinds to the
/// engine's shutdown routine and the process exits non-zero.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("{channel} connection lost: {reason}")]
    ConnectionLost { channel: Channel, reason: String },
    #[error("bus client error: {0}")]
    BusClient(#[from] rumqttc::ClientError),
    #[error("cloud request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("cloud protocol violation: {0}")]
    Protocol(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("task {name} ended abnormally: {source}")]
    Task {
        name: String,
        #[source]
        source: tokio::task::JoinError,
    },
}

impl BridgeError {
    pub fn connection_lost(channel: Channel, reason: impl Into<String>) -> Self {
        BridgeError::ConnectionLost { channel, reason: reason.into() }
    }

    /// Only rejected command input is recoverable; the caller logs it and moves on.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BridgeError::InvalidCommand(_))
    }

    /// The channel this error condemns, when it is tied to one.
    pub fn channel(&self) -> Option<Channel> {
        match self {
            BridgeError::ConnectionLost { channel, .. } => Some(*channel),
            BridgeError::BusClient(_) => Some(Channel::Bus),
            BridgeError::Http(_) | BridgeError::Protocol(_) => Some(Channel::Cloud),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_invalid_command_is_transient() {
        assert!(!BridgeError::InvalidCommand("bad mode".into()).is_fatal());
        assert!(BridgeError::connection_lost(Channel::Cloud, "reset").is_fatal());
        assert!(BridgeError::Protocol("short state".into()).is_fatal());
    }

    #[test]
    fn test_channel_attribution() {
        let err = BridgeError::connection_lost(Channel::Bus, "eof");
        assert_eq!(err.channel(), Some(Channel::Bus));
        assert_eq!(err.to_string(), "bus connection lost: eof");
        assert_eq!(BridgeError::Protocol("x".into()).channel(), Some(Channel::Cloud));
        assert_eq!(BridgeError::InvalidCommand("x".into()).channel(), None);
    }
}
