use crate::{
    transport::{Frame, FrameSink, FrameStream, Transport},
    ChannelError,
};
use bytes::Bytes;
use core::fmt;
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::{net::TcpStream, select, sync::Mutex, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, trace};

/// Reason sent with the close frame when a [`Channel`] is closed locally.
const CLOSE_REASON: &str = "bye";

/// How long [`Channel::close`] waits to write the close frame and shut the
/// transport down.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A [`Channel`] produced by [`dial`].
///
/// [`dial`]: crate::dial
pub type ClientChannel = Channel<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A [`Channel`] produced by a [`Listener`].
///
/// [`Listener`]: crate::Listener
#[cfg(feature = "axum")]
pub type ServerChannel = Channel<axum::extract::ws::WebSocket>;

/// A duplex message channel over a single [`Transport`].
///
/// The channel owns its transport exclusively. Sending and receiving use
/// separate halves, so one task may [`send`] while another waits in
/// [`recv`]. Wrap the channel in an [`Arc`] to share it between tasks.
///
/// Every closed-connection condition is reported as
/// [`ChannelError::Closed`], regardless of which side initiated it.
///
/// Dropping a channel without calling [`close`] releases the transport
/// without a close handshake, and fires the [`done`] signal.
///
/// [`send`]: Self::send
/// [`recv`]: Self::recv
/// [`close`]: Self::close
/// [`done`]: Self::done
/// [`Arc`]: std::sync::Arc
pub struct Channel<T: Transport> {
    sink: Mutex<T::Sink>,
    stream: Mutex<T::Stream>,
    closed: AtomicBool,
    /// Set once the peer's close frame or the end of the stream was seen.
    hung_up: AtomicBool,
    /// Fired when closing starts. Interrupts pending sends and receives.
    closing: CancellationToken,
    done: CancellationToken,
}

impl<T: Transport> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("closed", &self.closed.load(Ordering::Acquire))
            .field("hung_up", &self.hung_up.load(Ordering::Acquire))
            .field("done", &self.done.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> From<T> for Channel<T> {
    fn from(transport: T) -> Self {
        Self::new(transport)
    }
}

impl<T: Transport> Channel<T> {
    /// Wrap a connected transport. The channel takes ownership of it.
    pub fn new(transport: T) -> Self {
        let (sink, stream) = transport.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
            hung_up: AtomicBool::new(false),
            closing: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    /// True once [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get a future that resolves once the channel has fully closed.
    ///
    /// The signal fires exactly once: when [`Self::close`] finishes or is
    /// abandoned, or when the channel is dropped. Futures obtained after that
    /// resolve immediately.
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.done.clone().cancelled_owned()
    }

    /// The token backing [`Self::done`].
    pub(crate) fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    fn hang_up(&self) {
        self.hung_up.store(true, Ordering::Release);
    }

    /// True if a sink error only means the peer is gone.
    ///
    /// Once the peer's close has been read, the transport rejects further
    /// writes with errors whose types vary by transport, so any sink error
    /// counts as closed from then on.
    fn peer_gone(&self, err: &<T::Sink as FrameSink>::Error) -> bool {
        self.hung_up.load(Ordering::Acquire) || <T::Sink as FrameSink>::is_closed(err)
    }

    /// Send one binary message.
    ///
    /// Returns [`ChannelError::Closed`] if the channel is closed, including
    /// when [`Self::close`] is called while the send is waiting on the peer.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), ChannelError> {
        let data = data.into();
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        select! {
            biased;
            _ = self.closing.cancelled() => Err(ChannelError::Closed),
            res = async {
                let mut sink = self.sink.lock().await;
                trace!(len = data.len(), "sending message");
                sink.send_frame(Frame::Binary(data)).await
            } => res.map_err(|err| {
                let closed = self.is_closed() || self.peer_gone(&err);
                ChannelError::from_transport(err, closed)
            }),
        }
    }

    /// Receive the next message.
    ///
    /// Binary and text messages are returned alike. Ping and pong frames are
    /// skipped. Waits until a message arrives, the peer closes, or this
    /// channel is closed locally.
    pub async fn recv(&self) -> Result<Bytes, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let mut stream = self.stream.lock().await;
        loop {
            let next = select! {
                biased;
                _ = self.closing.cancelled() => return Err(ChannelError::Closed),
                next = stream.next_frame() => next,
            };

            match next {
                Some(Ok(Frame::Binary(data) | Frame::Text(data))) => {
                    trace!(len = data.len(), "received message");
                    return Ok(data);
                }
                Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => continue,
                Some(Ok(Frame::Close(Some((code, reason))))) => {
                    debug!(code, %reason, "received close frame");
                    self.hang_up();
                    return Err(ChannelError::Closed);
                }
                Some(Ok(Frame::Close(None))) | None => {
                    debug!("peer has gone away");
                    self.hang_up();
                    return Err(ChannelError::Closed);
                }
                Some(Err(err)) => {
                    let closed = <T::Stream as FrameStream>::is_closed(&err);
                    if closed {
                        self.hang_up();
                    }
                    return Err(ChannelError::from_transport(err, closed));
                }
            }
        }
    }

    /// Close the channel.
    ///
    /// Interrupts pending sends and receives, sends a close frame to the
    /// peer, then closes the transport whether or not the frame was sent,
    /// then fires the [`Self::done`] signal. Does not wait for the peer to
    /// acknowledge the close frame. Writing the frame and closing the
    /// transport are bounded by [`CLOSE_TIMEOUT`]; a peer that stops reading
    /// makes `close` fail after that long, but done fires regardless. Done
    /// also fires if the returned future is dropped before it completes.
    ///
    /// Failures that only mean the peer is already gone are not reported.
    /// Otherwise the error from sending the close frame takes precedence over
    /// the error from closing the transport. Calling `close` again returns
    /// [`ChannelError::Closed`] and has no other effect.
    pub async fn close(&self) -> Result<(), ChannelError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::Closed);
        }
        self.closing.cancel();
        let _done = self.done.clone().drop_guard();

        let res = match timeout(CLOSE_TIMEOUT, self.shut_down()).await {
            Ok(res) => res,
            Err(elapsed) => {
                debug!("timed out closing channel");
                Err(ChannelError::Transport(Box::new(elapsed)))
            }
        };
        debug!("channel closed");
        res
    }

    async fn shut_down(&self) -> Result<(), ChannelError> {
        let mut sink = self.sink.lock().await;
        let notified = sink.send_frame(Frame::normal_close(CLOSE_REASON)).await;
        let shutdown = sink.close().await;

        let report = |res: Result<(), <T::Sink as FrameSink>::Error>| {
            res.or_else(|err| {
                if self.peer_gone(&err) {
                    Ok(())
                } else {
                    Err(ChannelError::Transport(Box::new(err)))
                }
            })
        };
        report(notified).and(report(shutdown))
    }
}

impl<T: Transport> Drop for Channel<T> {
    fn drop(&mut self) {
        self.closing.cancel();
        self.done.cancel();
    }
}
