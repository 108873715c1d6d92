//! Errors returned by gateway operations.

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// Connecting to the gateway failed.
#[derive(Debug)]
pub struct ConnectingError {
    pub(crate) kind: ConnectingErrorType,
    pub(crate) source: Option<Box<dyn Error + Send + Sync>>,
}

impl ConnectingError {
    /// Immutable reference to the type of error that occurred.
    pub const fn kind(&self) -> &ConnectingErrorType {
        &self.kind
    }

    /// Consume the error, returning the owned error type and the source
    /// error.
    #[must_use = "consuming the error into its parts has no effect if left unused"]
    pub fn into_parts(self) -> (ConnectingErrorType, Option<Box<dyn Error + Send + Sync>>) {
        (self.kind, self.source)
    }
}

impl Display for ConnectingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match &self.kind {
            ConnectingErrorType::Establishing => f.write_str("failed to establish the connection"),
            ConnectingErrorType::ParsingUrl { url } => {
                f.write_str("the gateway url `")?;
                f.write_str(url)?;

                f.write_str("` is invalid")
            }
        }
    }
}

impl Error for ConnectingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// Type of [`ConnectingError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum ConnectingErrorType {
    /// Establishing the websocket connection failed, such as due to network
    /// or TLS errors.
    Establishing,
    /// The configured gateway URL is invalid.
    ParsingUrl {
        /// URL that couldn't be parsed.
        url: String,
    },
}

/// Sending a message over the session failed.
#[derive(Debug)]
pub struct SendError {
    pub(crate) kind: SendErrorType,
    pub(crate) source: Option<Box<dyn Error + Send + Sync>>,
}

impl SendError {
    /// Immutable reference to the type of error that occurred.
    pub const fn kind(&self) -> &SendErrorType {
        &self.kind
    }
}

impl Display for SendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.kind {
            SendErrorType::Sending => {
                f.write_str("the connection is closed and the message wasn't sent")
            }
            SendErrorType::Serializing => f.write_str("the payload failed to serialize"),
        }
    }
}

impl Error for SendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// Type of [`SendError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum SendErrorType {
    /// The socket writer has hung up. The connection is either being
    /// re-established or the client has shut down.
    Sending,
    /// Serializing the payload failed.
    Serializing,
}

#[cfg(test)]
mod tests {
    use super::{ConnectingError, ConnectingErrorType, SendError, SendErrorType};
    use static_assertions::assert_impl_all;
    use std::{error::Error, fmt::Debug};

    assert_impl_all!(ConnectingError: Debug, Error, Send, Sync);
    assert_impl_all!(ConnectingErrorType: Debug, Send, Sync);
    assert_impl_all!(SendError: Debug, Error, Send, Sync);
    assert_impl_all!(SendErrorType: Debug, Send, Sync);

    #[test]
    fn display() {
        let error = ConnectingError {
            kind: ConnectingErrorType::ParsingUrl {
                url: "wss://".to_owned(),
            },
            source: None,
        };
        assert_eq!("the gateway url `wss://` is invalid", error.to_string());

        let error = SendError {
            kind: SendErrorType::Sending,
            source: None,
        };
        assert_eq!(
            "the connection is closed and the message wasn't sent",
            error.to_string()
        );
    }
}
