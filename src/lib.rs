//! wschannel: duplex message channels over WebSockets.
//!
//! This crate lets an RPC layer exchange discrete messages with a peer
//! without caring whether the connection was dialed out or accepted by an
//! HTTP server. It provides:
//!
//! - [`Channel`], which wraps one WebSocket connection with `send`, `recv`,
//!   `close` and a `done` signal. Every closed-connection condition is
//!   reported as [`ChannelError::Closed`].
//! - [`dial`], which connects to a `ws://` or `wss://` endpoint and returns a
//!   [`ClientChannel`].
#![cfg_attr(
    feature = "axum",
    doc = "- [`Listener`], an [`axum`] handler that queues upgraded connections \
           and hands them out through [`Listener::accept`]."
)]
//!
//! ## Basic usage
//!
//! ```no_run
//! # #[cfg(feature = "axum")]
//! # {
//! use wschannel::{dial, ListenOptions, Listener};
//! use tokio_util::sync::CancellationToken;
//! use std::future::IntoFuture;
//!
//! # async fn _main() -> Result<(), Box<dyn std::error::Error>> {
//! // At most 4 connections wait to be accepted. Others get a 503.
//! let listener = Listener::new(ListenOptions::new().with_max_pending(4));
//! let tcp = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//! tokio::spawn(axum::serve(tcp, listener.clone().into_axum("/ws")).into_future());
//!
//! let client = dial("ws://127.0.0.1:3000/ws", None).await?;
//! let server = listener.accept(&CancellationToken::new()).await?;
//!
//! client.send("ping").await?;
//! assert_eq!(server.recv().await?, "ping");
//!
//! client.close().await?;
//! server.close().await?;
//! listener.close().await?;
//! # Ok(())
//! # }}
//! ```
//!
//! ## Backpressure
//!
//! The listener queue is the only admission control. When it holds
//! `max_pending` unaccepted connections, further handshakes are refused with
//! `503 Service Unavailable` before upgrading, and clients see
//! [`DialError::Rejected`]. Such failures are transient and may be retried.
//!
//! ## Shutdown
//!
//! [`Channel::close`] sends a close frame, closes the transport even if that
//! failed, and then fires the [`Channel::done`] signal. It does not wait for
//! the peer to acknowledge the close frame.
//!
#![cfg_attr(
    feature = "axum",
    doc = "[`Listener::close`] stops admitting connections, closes queued \
           connections nobody accepted, and waits until every connection it \
           admitted has closed."
)]

#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub,
    clippy::missing_const_for_fn,
    rustdoc::all
)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[cfg(feature = "axum")]
mod admission;
#[cfg(feature = "axum")]
pub use admission::{CheckAccept, Rejection};

mod broker;
pub use broker::DEFAULT_MAX_PENDING;

mod channel;
#[cfg(feature = "axum")]
pub use channel::ServerChannel;
pub use channel::{Channel, ClientChannel, CLOSE_TIMEOUT};

mod dial;
pub use dial::{dial, DialOptions};

mod error;
pub use error::{AcceptError, BoxError, ChannelError, DialError, ListenerError};

#[cfg(feature = "axum")]
mod listener;
#[cfg(feature = "axum")]
pub use listener::{ws_listener, ListenOptions, Listener, UpgradePolicy};

pub mod transport;

/// Re-export of the `tokio-tungstenite` crate, for configuring [`dial`].
pub use tokio_tungstenite;
