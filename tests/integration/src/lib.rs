//! Shared helpers for the end-to-end tests: spin up an in-process
//! daemon on a loopback TCP listener and hand out clients for it.

use std::sync::Arc;
use std::time::Duration;

use cairn_core::client::{Client, Endpoint};
use cairn_core::config::DaemonConfig;
use cairn_core::wire::Mode;
use cairnd::{stream, Server};

/// Start a daemon with a loopback stream listener and no bound mesh
/// interfaces. Returns the server and a client talking to it.
pub async fn test_daemon(mode: Mode) -> (Arc<Server>, Client) {
    let config = DaemonConfig {
        mode: mode as u8,
        listen_unix: String::new(),
        // keep test transactions snappy
        wait_complete: Duration::from_millis(100),
        wait_master_reply: Duration::from_millis(200),
        ..DaemonConfig::default()
    };
    let server = Server::new(config);
    let addr = stream::spawn_tcp_listener(server.clone(), "127.0.0.1:0")
        .await
        .expect("bind test listener");
    let client = Client::new(
        Endpoint::Tcp(addr.to_string()),
        Duration::from_secs(2),
    );
    (server, client)
}

/// Poll `probe` until it returns some value or the deadline passes.
pub async fn wait_for<T>(
    mut probe: impl FnMut() -> Option<T>,
    deadline: Duration,
) -> Option<T> {
    let start = tokio::time::Instant::now();
    loop {
        if let Some(value) = probe() {
            return Some(value);
        }
        if start.elapsed() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
