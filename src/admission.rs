use axum::{
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use std::borrow::Cow;

/// An admission check refused an inbound connection.
///
/// The status defaults to `500 Internal Server Error` when none is given.
/// The reason is sent to the connecting party as the response body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("connection rejected: {reason}")]
pub struct Rejection {
    status: Option<StatusCode>,
    reason: Cow<'static, str>,
}

impl Rejection {
    /// Create a rejection with the default status.
    pub fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status: None,
            reason: reason.into(),
        }
    }

    /// Set the HTTP status reported to the connecting party.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    /// The HTTP status reported to the connecting party.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// The reason reported to the connecting party.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status(), self.reason.into_owned()).into_response()
    }
}

/// A predicate run on each inbound request before any upgrade is attempted.
///
/// Returning an error refuses the connection: no upgrade is performed and no
/// [`Channel`] is created. The check sees every request routed to the
/// listener, including ones that are not WebSocket handshakes.
///
/// This trait is implemented for all `Fn(&Parts) -> Result<(), Rejection>`
/// closures.
///
/// ```
/// use wschannel::{ListenOptions, Rejection};
/// use axum::http::{header::ORIGIN, StatusCode};
///
/// let opts = ListenOptions::default().with_check_accept(|req: &axum::http::request::Parts| {
///     match req.headers.get(ORIGIN) {
///         Some(origin) if origin == "https://example.com" => Ok(()),
///         _ => Err(Rejection::new("bad origin").with_status(StatusCode::FORBIDDEN)),
///     }
/// });
/// ```
///
/// [`Channel`]: crate::Channel
pub trait CheckAccept: Send + Sync + 'static {
    /// Decide whether to admit the request.
    fn check_accept(&self, req: &Parts) -> Result<(), Rejection>;
}

impl<F> CheckAccept for F
where
    F: Fn(&Parts) -> Result<(), Rejection> + Send + Sync + 'static,
{
    fn check_accept(&self, req: &Parts) -> Result<(), Rejection> {
        self(req)
    }
}
