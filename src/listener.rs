//! Accepting [`Channel`]s from an [`axum`] server.
//!
//! How this works:
//! `axum` serves each WebSocket handshake with a handler invocation, and
//! runs the upgraded connection in a task of its own. It does not offer a
//! pull-based `accept`. The [`Listener`] bridges the two: its handler admits
//! the request, reserves a slot in a bounded queue, and upgrades. The
//! upgraded-connection task then enqueues a [`Channel`] and stays alive until
//! that channel is done, so the server never considers the connection
//! finished while the channel is live. Consumers pull channels with
//! [`Listener::accept`].
//!
//! [`Channel`]: crate::Channel

use crate::{
    broker::{Broker, DEFAULT_MAX_PENDING},
    AcceptError, CheckAccept, ListenerError, ServerChannel,
};
use axum::{
    extract::{ws::WebSocket, FromRequestParts, Request, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
};
use core::fmt;
use std::{borrow::Cow, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, Instrument};

/// WebSocket protocol settings applied to each upgrade.
///
/// Unset values keep `axum`'s defaults. See [`WebSocketUpgrade`] for the
/// meaning of each setting.
#[derive(Debug, Clone, Default)]
pub struct UpgradePolicy {
    /// Read buffer capacity.
    pub read_buffer_size: Option<usize>,
    /// Target minimum size of the write buffer before flushing.
    pub write_buffer_size: Option<usize>,
    /// Maximum size of the write buffer.
    pub max_write_buffer_size: Option<usize>,
    /// Maximum size of an incoming message.
    pub max_message_size: Option<usize>,
    /// Maximum size of a single incoming frame.
    pub max_frame_size: Option<usize>,
    /// Accept frames that the client did not mask.
    pub accept_unmasked_frames: bool,
    /// Subprotocols the server is willing to select.
    pub protocols: Vec<Cow<'static, str>>,
}

impl UpgradePolicy {
    fn apply<F>(&self, mut ws: WebSocketUpgrade<F>) -> WebSocketUpgrade<F> {
        if let Some(size) = self.read_buffer_size {
            ws = ws.read_buffer_size(size);
        }
        if let Some(size) = self.write_buffer_size {
            ws = ws.write_buffer_size(size);
        }
        if let Some(max) = self.max_write_buffer_size {
            ws = ws.max_write_buffer_size(max);
        }
        if let Some(max) = self.max_message_size {
            ws = ws.max_message_size(max);
        }
        if let Some(max) = self.max_frame_size {
            ws = ws.max_frame_size(max);
        }
        if !self.protocols.is_empty() {
            ws = ws.protocols(self.protocols.clone());
        }
        ws.accept_unmasked_frames(self.accept_unmasked_frames)
    }
}

/// Settings for a [`Listener`].
///
/// The defaults admit every request, queue at most one unaccepted
/// connection, add no headers, and use `axum`'s upgrade settings.
#[derive(Clone, Default)]
pub struct ListenOptions {
    max_pending: usize,
    check: Option<Arc<dyn CheckAccept>>,
    header: HeaderMap,
    upgrade: UpgradePolicy,
}

impl fmt::Debug for ListenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenOptions")
            .field("max_pending", &self.max_pending())
            .field("check", &self.check.is_some())
            .field("header", &self.header)
            .field("upgrade", &self.upgrade)
            .finish()
    }
}

impl ListenOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of upgraded connections that may wait for
    /// [`Listener::accept`]. Further attempts are refused with
    /// `503 Service Unavailable`. Values below 1 are treated as 1.
    pub const fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Run `check` on each request before upgrading. See [`CheckAccept`].
    pub fn with_check_accept(mut self, check: impl CheckAccept) -> Self {
        self.check = Some(Arc::new(check));
        self
    }

    /// Include these headers in successful upgrade responses.
    pub fn with_header(mut self, header: HeaderMap) -> Self {
        self.header = header;
        self
    }

    /// Set the WebSocket protocol settings used for upgrades.
    pub fn with_upgrade(mut self, upgrade: UpgradePolicy) -> Self {
        self.upgrade = upgrade;
        self
    }

    /// The effective queue capacity.
    pub fn max_pending(&self) -> usize {
        if self.max_pending == 0 {
            DEFAULT_MAX_PENDING
        } else {
            self.max_pending
        }
    }
}

/// Bridges inbound WebSocket requests served by [`axum`] to [`Channel`]s
/// obtained with [`Listener::accept`].
///
/// Each upgraded connection is queued until accepted. The task serving the
/// connection stays open until its channel is closed. After
/// [`Listener::close`], no further connections are admitted, and any
/// connections admitted but not yet accepted are closed.
///
/// # Example
///
/// ```no_run
/// use wschannel::{ListenOptions, Listener};
/// use tokio_util::sync::CancellationToken;
/// use std::future::IntoFuture;
///
/// # async fn _main() -> Result<(), Box<dyn std::error::Error>> {
/// let listener = Listener::new(ListenOptions::new().with_max_pending(8));
///
/// let tcp = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
/// tokio::spawn(axum::serve(tcp, listener.clone().into_axum("/ws")).into_future());
///
/// let channel = listener.accept(&CancellationToken::new()).await?;
/// let request = channel.recv().await?;
/// channel.send(request).await?;
/// channel.close().await?;
/// # Ok(())
/// # }
/// ```
///
/// [`Channel`]: crate::Channel
#[derive(Clone)]
pub struct Listener {
    broker: Arc<Broker<WebSocket>>,
    opts: Arc<ListenOptions>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .field("opts", &self.opts)
            .finish()
    }
}

impl Default for Listener {
    fn default() -> Self {
        Self::new(ListenOptions::default())
    }
}

impl From<ListenOptions> for Listener {
    fn from(opts: ListenOptions) -> Self {
        Self::new(opts)
    }
}

impl Listener {
    /// Create a new listener with the given options.
    pub fn new(opts: ListenOptions) -> Self {
        Self {
            broker: Arc::new(Broker::new(opts.max_pending())),
            opts: Arc::new(opts),
        }
    }

    /// Instantiate a new [`axum::Router`] that serves this listener at
    /// `path`.
    pub fn into_axum(self, path: &str) -> axum::Router {
        axum::Router::new()
            .route(path, any(ws_listener))
            .with_state(self)
    }

    /// Wait until a connected channel is available, `cancel` fires, or the
    /// listener closes.
    ///
    /// The caller owns the returned channel and must close it. A fired token
    /// is reported as [`AcceptError::Cancelled`] even if the listener has
    /// closed or a channel is queued.
    pub async fn accept(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ServerChannel, AcceptError> {
        self.broker.accept(cancel).await
    }

    /// Close the listener.
    ///
    /// No further connections are admitted. Queued connections that were
    /// never accepted are closed. This then waits until every connection the
    /// listener admitted has finished, which includes channels previously
    /// returned by [`Self::accept`]: their owners must close them.
    ///
    /// Calling `close` again returns [`ListenerError::AlreadyClosed`].
    pub async fn close(&self) -> Result<(), ListenerError> {
        self.broker.close().await
    }

    /// True once [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.broker.is_closed()
    }

    /// Number of connections waiting to be accepted.
    pub fn pending(&self) -> usize {
        self.broker.pending()
    }

    /// Serve one inbound request.
    ///
    /// Runs the admission check, reserves a queue slot, and upgrades the
    /// connection. Refused requests get an error response and never reach
    /// the queue.
    pub async fn serve(&self, req: Request) -> Response {
        let (mut parts, _body) = req.into_parts();
        let span = debug_span!("ws connection", uri = %parts.uri);

        async move {
            if let Some(check) = &self.opts.check {
                if let Err(rejection) = check.check_accept(&parts) {
                    debug!(
                        status = %rejection.status(),
                        reason = rejection.reason(),
                        "connection rejected"
                    );
                    return rejection.into_response();
                }
            }

            let ws = match <WebSocketUpgrade as FromRequestParts<()>>::from_request_parts(
                &mut parts,
                &(),
            )
            .await
            {
                Ok(ws) => ws,
                Err(rejection) => {
                    debug!(%rejection, "not a websocket handshake");
                    return rejection.into_response();
                }
            };

            let reservation = match self.broker.reserve() {
                Ok(reservation) => reservation,
                Err(refusal) => {
                    debug!(%refusal, "connection refused");
                    return (StatusCode::SERVICE_UNAVAILABLE, refusal.to_string())
                        .into_response();
                }
            };

            let conn_span = tracing::Span::current();
            let mut response = self
                .opts
                .upgrade
                .apply(ws)
                .on_failed_upgrade(|err: axum::Error| debug!(%err, "websocket upgrade failed"))
                .on_upgrade(move |socket| reservation.fulfill(socket).instrument(conn_span));
            response.headers_mut().extend(self.opts.header.clone());
            response
        }
        .instrument(span)
        .await
    }
}

/// Axum handler that serves a [`Listener`].
///
/// Used to mount a [`Listener`] on an existing [`axum::Router`]. The listener
/// is passed as the [`State`] of the route.
///
/// ```no_run
/// # use wschannel::{ws_listener, Listener};
/// # fn _main(listener: Listener, axum: axum::Router<Listener>) -> axum::Router<()> {
/// axum.route("/ws", axum::routing::any(ws_listener))
///     .with_state(listener)
/// # }
/// ```
pub async fn ws_listener(State(listener): State<Listener>, req: Request) -> Response {
    listener.serve(req).await
}
