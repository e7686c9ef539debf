use tokio_tungstenite::tungstenite::{self, error::ProtocolError};

/// Boxed error type used to carry transport failures through [`ChannelError`].
pub type BoxError = Box<dyn core::error::Error + Send + Sync + 'static>;

/// Errors produced by [`Channel`] operations.
///
/// Every condition that means "this channel can no longer be used" is
/// reported as [`ChannelError::Closed`], whether the channel was closed
/// locally, the peer sent a close frame, or the connection dropped. Callers
/// can check liveness with [`ChannelError::is_closed`] without knowing which
/// transport is underneath.
///
/// [`Channel`]: crate::Channel
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel is closed.
    #[error("channel is closed")]
    Closed,
    /// The transport failed for a reason other than closure.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
}

impl ChannelError {
    /// Wrap a transport error, classifying closed-connection conditions.
    pub(crate) fn from_transport<E>(err: E, is_closed: bool) -> Self
    where
        E: core::error::Error + Send + Sync + 'static,
    {
        if is_closed {
            Self::Closed
        } else {
            Self::Transport(Box::new(err))
        }
    }

    /// True if this is the [`ChannelError::Closed`] classification.
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Errors returned by [`Listener::accept`].
///
/// [`Listener::accept`]: crate::Listener::accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcceptError {
    /// The listener is closed and no queued channels remain.
    #[error("listener is closed")]
    Closed,
    /// The cancellation token fired before a channel became available.
    #[error("accept cancelled")]
    Cancelled,
}

/// Errors returned by [`Listener::close`].
///
/// [`Listener::close`]: crate::Listener::close
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// The listener was already closed by an earlier call.
    #[error("listener is already closed")]
    AlreadyClosed,
    /// Shutdown completed, but closing a queued channel failed.
    #[error("failed to close a pending channel: {0}")]
    Drain(#[source] ChannelError),
}

/// Errors returned by [`dial`].
///
/// [`dial`]: crate::dial
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    /// The server answered the handshake with something other than a
    /// protocol switch.
    #[error("handshake rejected with status {status}: {body}")]
    Rejected {
        /// The HTTP status returned by the server.
        status: u16,
        /// The response body, if the server sent one.
        body: String,
    },
    /// The URL or the configured headers do not form a valid request.
    #[error("invalid handshake request: {0}")]
    InvalidRequest(#[source] tungstenite::Error),
    /// The endpoint could not be reached, or the connection failed before
    /// the server answered the handshake.
    #[error("failed to connect: {0}")]
    Connect(#[source] tungstenite::Error),
}

impl From<tungstenite::Error> for DialError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => {
                let body = response
                    .body()
                    .as_deref()
                    .map(|body| String::from_utf8_lossy(body).trim().to_owned())
                    .unwrap_or_default();
                Self::Rejected {
                    status: response.status().as_u16(),
                    body,
                }
            }
            err @ (tungstenite::Error::Url(_) | tungstenite::Error::HttpFormat(_)) => {
                Self::InvalidRequest(err)
            }
            err => Self::Connect(err),
        }
    }
}

/// True if a `tungstenite` error means the connection is gone.
pub(crate) fn tungstenite_closed(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Protocol(
            ProtocolError::ResetWithoutClosingHandshake | ProtocolError::SendAfterClosing,
        ) => true,
        tungstenite::Error::Io(err) => io_closed(err),
        _ => false,
    }
}

/// True if `err`, or any error in its source chain, is an I/O error meaning
/// the connection is gone.
#[cfg_attr(not(feature = "axum"), allow(dead_code))]
pub(crate) fn source_closed(err: &(dyn core::error::Error + 'static)) -> bool {
    let mut next = Some(err);
    while let Some(err) = next {
        if err.downcast_ref::<std::io::Error>().is_some_and(io_closed) {
            return true;
        }
        next = err.source();
    }
    false
}

fn io_closed(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio_tungstenite::tungstenite::http::{Response, StatusCode};

    #[test]
    fn classifies_closed_conditions() {
        assert!(tungstenite_closed(&tungstenite::Error::ConnectionClosed));
        assert!(tungstenite_closed(&tungstenite::Error::AlreadyClosed));
        assert!(tungstenite_closed(&tungstenite::Error::Protocol(
            ProtocolError::ResetWithoutClosingHandshake
        )));
        assert!(tungstenite_closed(&tungstenite::Error::Io(
            std::io::ErrorKind::BrokenPipe.into()
        )));
        assert!(!tungstenite_closed(&tungstenite::Error::Io(
            std::io::ErrorKind::PermissionDenied.into()
        )));
    }

    #[test]
    fn walks_source_chain() {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(source_closed(&tungstenite::Error::Io(reset)));

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(!source_closed(&tungstenite::Error::Io(denied)));
        assert!(!source_closed(&tungstenite::Error::ConnectionClosed));
    }

    #[test]
    fn rejection_surfaces_body() {
        let response = Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(Some(b"connection queue is full\n".to_vec()))
            .unwrap();

        let err = DialError::from(tungstenite::Error::Http(response.into()));
        match &err {
            DialError::Rejected { status, body } => {
                assert_eq!(*status, 503);
                assert_eq!(body, "connection queue is full");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("connection queue is full"));
    }
}
