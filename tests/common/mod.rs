#![allow(dead_code)]

use std::time::Duration;
use tokio::{net::TcpListener, task::JoinHandle, time};
use wschannel::Listener;

/// How long tests wait for something that should happen promptly.
pub const WAIT: Duration = Duration::from_secs(2);

/// Install a test log subscriber. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Serve the listener at `/ws` on an ephemeral local port, returning the
/// WebSocket URL and the server task.
pub async fn serve(listener: Listener) -> (String, JoinHandle<()>) {
    init_tracing();
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();

    let server = tokio::spawn(async move {
        axum::serve(tcp, listener.into_axum("/ws")).await.unwrap();
    });

    (format!("ws://{addr}/ws"), server)
}

/// Poll `cond` until it holds, panicking after [`WAIT`].
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    time::timeout(WAIT, async {
        while !cond() {
            time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
