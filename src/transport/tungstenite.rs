use crate::{
    error::tungstenite_closed,
    transport::{Frame, FrameSink, FrameStream, Transport},
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    tungstenite::{
        self,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    WebSocketStream,
};

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Binary(bin) => Self::Binary(bin),
            Message::Text(text) => Self::Text(text.into()),
            Message::Close(frame) => {
                Self::Close(frame.map(|f| (u16::from(f.code), f.reason.as_str().to_owned())))
            }
            Message::Ping(data) => Self::Ping(data),
            Message::Pong(data) => Self::Pong(data),
            // raw frames are never produced by reads
            Message::Frame(frame) => Self::Pong(frame.into_payload()),
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Binary(bin) => Self::Binary(bin),
            Frame::Text(text) => Self::Text(String::from_utf8_lossy(&text).into_owned().into()),
            Frame::Close(frame) => Self::Close(frame.map(|(code, reason)| CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
            Frame::Ping(data) => Self::Ping(data),
            Frame::Pong(data) => Self::Pong(data),
        }
    }
}

impl<S> Transport for WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Sink = SplitSink<WebSocketStream<S>, Message>;
    type Stream = SplitStream<WebSocketStream<S>>;

    fn split(self) -> (Self::Sink, Self::Stream) {
        StreamExt::split(self)
    }
}

impl<S> FrameSink for SplitSink<WebSocketStream<S>, Message>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Error = tungstenite::Error;

    async fn send_frame(&mut self, frame: Frame) -> Result<(), Self::Error> {
        self.send(frame.into()).await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        SinkExt::close(self).await
    }

    fn is_closed(err: &Self::Error) -> bool {
        tungstenite_closed(err)
    }
}

impl<S> FrameStream for SplitStream<WebSocketStream<S>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Error = tungstenite::Error;

    async fn next_frame(&mut self) -> Option<Result<Frame, Self::Error>> {
        self.next().await.map(|res| res.map(Into::into))
    }

    fn is_closed(err: &Self::Error) -> bool {
        tungstenite_closed(err)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn frame_to_message() {
        let ping = Message::from(Frame::Ping(Bytes::from_static(b"hb")));
        assert!(matches!(ping, Message::Ping(data) if data == "hb"));

        let text = Message::from(Frame::Text(Bytes::from_static(b"ok\xff")));
        assert!(matches!(text, Message::Text(text) if text.as_str() == "ok\u{fffd}"));
    }
}
