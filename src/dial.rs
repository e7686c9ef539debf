use crate::{Channel, ClientChannel, DialError};
use core::fmt;
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderMap, protocol::WebSocketConfig},
    Connector,
};
use tracing::{debug, debug_span, Instrument};

/// Settings for [`dial`].
///
/// The defaults send no extra headers and use `tokio-tungstenite`'s default
/// protocol settings and TLS configuration.
#[derive(Default)]
pub struct DialOptions {
    header: HeaderMap,
    config: Option<WebSocketConfig>,
    disable_nagle: bool,
    connector: Option<Connector>,
}

impl fmt::Debug for DialOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialOptions")
            .field("header", &self.header)
            .field("config", &self.config)
            .field("disable_nagle", &self.disable_nagle)
            .field("connector", &self.connector.is_some())
            .finish()
    }
}

impl DialOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Send these headers with the handshake request.
    pub fn with_header(mut self, header: HeaderMap) -> Self {
        self.header = header;
        self
    }

    /// Set the WebSocket protocol settings for the connection.
    pub const fn with_config(mut self, config: WebSocketConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Disable Nagle's algorithm on the underlying TCP socket.
    pub const fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.disable_nagle = nodelay;
        self
    }

    /// Use this connector to establish `wss://` connections.
    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.connector = Some(connector);
        self
    }
}

/// Dial the WebSocket endpoint at `url` (`ws://...` or `wss://...`) and
/// negotiate a client channel. Pass `None` for default settings.
///
/// If the server refuses the handshake, the error is
/// [`DialError::Rejected`] and carries the status and body the server sent,
/// e.g. the reason given by a [`CheckAccept`] hook.
///
/// ```no_run
/// # async fn _main() -> Result<(), Box<dyn std::error::Error>> {
/// let channel = wschannel::dial("ws://127.0.0.1:8080/ws", None).await?;
/// channel.send("hello").await?;
/// let reply = channel.recv().await?;
/// channel.close().await?;
/// # Ok(())
/// # }
/// ```
///
/// [`CheckAccept`]: crate::CheckAccept
pub async fn dial(url: &str, opts: Option<DialOptions>) -> Result<ClientChannel, DialError> {
    let span = debug_span!("dial", %url);

    async move {
        let mut request = url
            .into_client_request()
            .map_err(DialError::InvalidRequest)?;

        let DialOptions {
            header,
            config,
            disable_nagle,
            connector,
        } = opts.unwrap_or_default();
        request.headers_mut().extend(header);

        let (stream, response) =
            connect_async_tls_with_config(request, config, disable_nagle, connector)
                .await
                .inspect_err(|err| debug!(%err, "dial failed"))?;

        debug!(status = %response.status(), "connected");
        Ok(Channel::new(stream))
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn invalid_url() {
        let err = dial("not a url", None).await.unwrap_err();
        assert!(matches!(err, DialError::InvalidRequest(_)), "{err}");
    }

    #[tokio::test]
    async fn unreachable_endpoint() {
        let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        drop(tcp);

        let err = dial(&format!("ws://{addr}"), None).await.unwrap_err();
        assert!(matches!(err, DialError::Connect(_)), "{err}");
    }
}
