//! Stream transport — TCP and Unix socket listeners for local clients.
//!
//! A client sends exactly one request packet and reads until we close
//! the connection. Replies to a Request are PushData frames followed by
//! EOF; failure is a StatusError carrying the request's transaction id.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;

use cairn_core::client::iface_table_names;
use cairn_core::wire::{self, Mode, Packet, TransactionId};

use crate::sender::{self, StreamSink, SEND_QUEUE};
use crate::transaction;
use crate::Server;

/// Bind a TCP stream listener and spawn its accept loop.
pub async fn spawn_tcp_listener(server: Arc<Server>, addr: &str) -> Result<std::net::SocketAddr> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding stream listener on {addr}"))?;
    let local = listener.local_addr()?;
    tracing::info!(%local, "tcp stream listener starting");
    let mut quit = server.subscribe_shutdown();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = quit.recv() => {
                    tracing::info!("tcp stream listener stopping");
                    return;
                }
                accepted = listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(c) => c,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed, stop listening");
                            return;
                        }
                    };
                    tracing::debug!(%peer, "stream connection");
                    let server = server.clone();
                    tokio::spawn(async move {
                        handle_connection(server, conn).await;
                    });
                }
            }
        }
    });
    Ok(local)
}

/// Bind a Unix stream listener and spawn its accept loop. A stale socket
/// file from a previous run is removed first.
pub fn spawn_unix_listener(server: Arc<Server>, path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("binding unix listener on {}", path.display()))?;
    tracing::info!(path = %path.display(), "unix stream listener starting");
    let mut quit = server.subscribe_shutdown();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = quit.recv() => {
                    tracing::info!("unix stream listener stopping");
                    return;
                }
                accepted = listener.accept() => {
                    let (conn, _) = match accepted {
                        Ok(c) => c,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed, stop listening");
                            return;
                        }
                    };
                    let server = server.clone();
                    tokio::spawn(async move {
                        handle_connection(server, conn).await;
                    });
                }
            }
        }
    });
    Ok(())
}

/// Handle one stream connection: read a single packet, act on it, close.
async fn handle_connection<C>(server: Arc<Server>, mut conn: C)
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let packet = match wire::read_packet(&mut conn).await {
        Ok(Some(p)) => p,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(error = %e, "cannot parse stream request");
            return;
        }
    };

    match packet {
        Packet::Request {
            requested_type,
            tx_id,
        } => {
            if server.mode() == Mode::Slave && !server.forward_request(requested_type).await {
                report_error(&mut conn, tx_id).await;
                return;
            }
            // answer from the own store (now holding the forwarded
            // records in slave mode)
            let (tx, rx) = mpsc::channel(SEND_QUEUE);
            let feeder = {
                let server = server.clone();
                tokio::spawn(async move {
                    server.store.send_all(requested_type, false, tx).await;
                })
            };
            {
                let mut sink = StreamSink(&mut conn);
                if let Err(e) =
                    sender::send_data(&mut sink, tx_id, rx, true, server.max_payload).await
                {
                    tracing::warn!(error = %e, "error sending data to stream client");
                }
            }
            let _ = feeder.await;
            let _ = conn.shutdown().await;
        }

        Packet::PushData { tx, mut data } => {
            // anonymous local records get our first interface's address
            for d in &mut data {
                if d.source.is_unset() {
                    match server.first_interface() {
                        Some(addr) => d.source = addr,
                        None => {
                            tracing::warn!(
                                "want to store local data but have no interface address, skipping"
                            );
                            return;
                        }
                    }
                }
            }
            let t = transaction::get_or_start(
                server.transactions(),
                tx.id,
                server.store.clone(),
                true,
                server.policy(),
            );
            t.feed(tx.seq_no, data).await;
            t.complete(tx.seq_no.wrapping_add(1)).await;
        }

        Packet::ModeSwitch { mode } => match Mode::try_from(mode) {
            Ok(mode) => server.set_mode(mode),
            Err(_) => tracing::warn!(mode, "ignoring unknown mode"),
        },

        Packet::ChangeInterface { ifaces } => {
            let names = iface_table_names(&ifaces);
            tracing::info!(?names, "rebinding interfaces on client request");
            server.rebind_interfaces(&names);
        }

        other => {
            tracing::warn!(kind = other.kind(), "unexpected packet on stream socket");
        }
    }
}

async fn report_error<C: AsyncWrite + Unpin>(conn: &mut C, tx_id: u16) {
    let status = Packet::StatusError(TransactionId {
        id: tx_id,
        seq_no: 0,
    });
    if let Ok(bytes) = status.encode() {
        let _ = conn.write_all(&bytes).await;
        let _ = conn.flush().await;
    }
    let _ = conn.shutdown().await;
}
