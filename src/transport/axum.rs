use crate::{
    error::source_closed,
    transport::{Frame, FrameSink, FrameStream, Transport},
};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Binary(bin) => Self::Binary(bin),
            Message::Text(text) => Self::Text(text.into()),
            Message::Close(frame) => {
                Self::Close(frame.map(|f| (f.code, f.reason.as_str().to_owned())))
            }
            Message::Ping(data) => Self::Ping(data),
            Message::Pong(data) => Self::Pong(data),
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Binary(bin) => Self::Binary(bin),
            Frame::Text(text) => Self::Text(String::from_utf8_lossy(&text).into_owned().into()),
            Frame::Close(frame) => Self::Close(frame.map(|(code, reason)| CloseFrame {
                code,
                reason: reason.into(),
            })),
            Frame::Ping(data) => Self::Ping(data),
            Frame::Pong(data) => Self::Pong(data),
        }
    }
}

/// `axum` wraps the error of its own `tungstenite` version, which need not
/// be the one this crate links. Only I/O errors in the source chain are
/// recognized here; protocol-level closure is tracked by the [`Channel`].
///
/// [`Channel`]: crate::Channel
fn axum_closed(err: &axum::Error) -> bool {
    source_closed(err)
}

impl Transport for WebSocket {
    type Sink = SplitSink<WebSocket, Message>;
    type Stream = SplitStream<WebSocket>;

    fn split(self) -> (Self::Sink, Self::Stream) {
        StreamExt::split(self)
    }
}

impl FrameSink for SplitSink<WebSocket, Message> {
    type Error = axum::Error;

    async fn send_frame(&mut self, frame: Frame) -> Result<(), Self::Error> {
        self.send(frame.into()).await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        SinkExt::close(self).await
    }

    fn is_closed(err: &Self::Error) -> bool {
        axum_closed(err)
    }
}

impl FrameStream for SplitStream<WebSocket> {
    type Error = axum::Error;

    async fn next_frame(&mut self) -> Option<Result<Frame, Self::Error>> {
        self.next().await.map(|res| res.map(Into::into))
    }

    fn is_closed(err: &Self::Error) -> bool {
        axum_closed(err)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io;
    use tokio_tungstenite::tungstenite;

    #[test]
    fn classifies_io_errors() {
        assert!(axum_closed(&axum::Error::new(io::Error::from(
            io::ErrorKind::BrokenPipe
        ))));
        // any tungstenite version, as long as the I/O error is a source
        assert!(axum_closed(&axum::Error::new(tungstenite::Error::Io(
            io::ErrorKind::ConnectionReset.into()
        ))));
        assert!(!axum_closed(&axum::Error::new(io::Error::from(
            io::ErrorKind::PermissionDenied
        ))));
        assert!(!axum_closed(&axum::Error::new(
            tungstenite::Error::ConnectionClosed
        )));
    }

    #[test]
    fn control_frames_keep_payload() {
        let ping = Message::Ping(bytes::Bytes::from_static(b"hb"));
        assert_eq!(Frame::from(ping), Frame::Ping(bytes::Bytes::from_static(b"hb")));

        let pong = Message::from(Frame::Pong(bytes::Bytes::from_static(b"hb")));
        assert!(matches!(pong, Message::Pong(data) if data == "hb"));
    }
}
