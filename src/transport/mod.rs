//! Transport abstraction for [`Channel`]s.
//!
//! A [`Transport`] is any duplex, message-oriented connection that can be
//! split into a [`FrameSink`] and a [`FrameStream`]. The crate provides
//! implementations for [`tokio_tungstenite::WebSocketStream`] over any async
//! byte stream, and (with the `axum` feature) for
//! [`axum::extract::ws::WebSocket`].
//!
//! Custom transports may implement these traits to reuse the [`Channel`]
//! close and error semantics, e.g. for in-process testing.
//!
//! [`Channel`]: crate::Channel

use bytes::Bytes;
use std::future::Future;

#[cfg(feature = "axum")]
mod axum;

mod tungstenite;

/// WebSocket close code for a normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// A single message read from or written to a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A binary data message.
    Binary(Bytes),
    /// A text data message, as raw UTF-8.
    ///
    /// Invalid UTF-8 is replaced with `U+FFFD` when the frame is written.
    Text(Bytes),
    /// A close notification with its status code and reason.
    Close(Option<(u16, String)>),
    /// A ping with its application data.
    Ping(Bytes),
    /// A pong with its application data.
    Pong(Bytes),
}

impl Frame {
    /// A normal-closure close frame with the given reason.
    pub fn normal_close(reason: impl Into<String>) -> Self {
        Self::Close(Some((NORMAL_CLOSURE, reason.into())))
    }
}

/// A duplex message connection that can be split into halves.
pub trait Transport: Send + 'static {
    /// The sending half.
    type Sink: FrameSink;
    /// The receiving half.
    type Stream: FrameStream;

    /// Split the transport into its sending and receiving halves.
    fn split(self) -> (Self::Sink, Self::Stream);
}

/// The sending half of a [`Transport`].
pub trait FrameSink: Send + 'static {
    /// Error type for the sink.
    type Error: core::error::Error + Send + Sync + 'static;

    /// Write one frame and flush it.
    fn send_frame(&mut self, frame: Frame) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Flush and close the underlying connection.
    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// True if the error means the connection is already gone.
    fn is_closed(err: &Self::Error) -> bool;
}

/// The receiving half of a [`Transport`].
pub trait FrameStream: Send + 'static {
    /// Error type for the stream.
    type Error: core::error::Error + Send + Sync + 'static;

    /// Read the next frame. `None` indicates the stream has ended.
    fn next_frame(&mut self) -> impl Future<Output = Option<Result<Frame, Self::Error>>> + Send;

    /// True if the error means the connection is already gone.
    fn is_closed(err: &Self::Error) -> bool;
}
