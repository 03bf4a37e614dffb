//! Stream client for talking to a local daemon.
//!
//! The daemon closes the connection after handling one request, so every
//! call opens a fresh connection. A request's reply is a sequence of
//! PushData frames terminated by EOF; a StatusError frame carrying the
//! request's transaction id signals failure.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

use crate::wire::{self, Data, Packet, TransactionId, WireError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("server reported an error for this request")]
    Status,

    #[error("bad data received from server")]
    Protocol,

    #[error("operation timed out")]
    Timeout,

    #[error("unknown network {0:?} (expected \"tcp\" or \"unix\")")]
    UnknownNetwork(String),
}

/// Where the daemon's stream socket lives.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    /// Build from a (network, address) pair as found in configuration,
    /// e.g. `("unix", "/var/run/cairn.sock")` or `("tcp", "[::1]:16962")`.
    pub fn parse(network: &str, address: &str) -> Result<Endpoint, ClientError> {
        match network {
            "tcp" => Ok(Endpoint::Tcp(address.to_string())),
            "unix" => Ok(Endpoint::Unix(PathBuf::from(address))),
            other => Err(ClientError::UnknownNetwork(other.to_string())),
        }
    }
}

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A client for one daemon endpoint. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Client {
    endpoint: Endpoint,
    /// Deadline applied to every network operation.
    pub timeout: Duration,
}

impl Client {
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Client {
        Client { endpoint, timeout }
    }

    async fn connect(&self) -> Result<Box<dyn Stream>, ClientError> {
        let conn: Box<dyn Stream> = match &self.endpoint {
            Endpoint::Tcp(addr) => Box::new(
                tokio::time::timeout(self.timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| ClientError::Timeout)??,
            ),
            Endpoint::Unix(path) => Box::new(
                tokio::time::timeout(self.timeout, UnixStream::connect(path))
                    .await
                    .map_err(|_| ClientError::Timeout)??,
            ),
        };
        Ok(conn)
    }

    async fn send(&self, conn: &mut Box<dyn Stream>, packet: &Packet) -> Result<(), ClientError> {
        let bytes = packet.encode()?;
        tokio::time::timeout(self.timeout, async {
            conn.write_all(&bytes).await?;
            conn.flush().await
        })
        .await
        .map_err(|_| ClientError::Timeout)??;
        Ok(())
    }

    /// Request all records of `requested_type` and invoke `handler` for
    /// each one. Parse failures inside the handler are the handler's
    /// business; a returned error aborts the request.
    pub async fn request<F>(&self, requested_type: u8, mut handler: F) -> Result<(), ClientError>
    where
        F: FnMut(Data) -> Result<(), ClientError>,
    {
        let tx_id: u16 = rand::random();
        let mut conn = self.connect().await?;
        self.send(
            &mut conn,
            &Packet::Request {
                requested_type,
                tx_id,
            },
        )
        .await?;
        loop {
            let packet = tokio::time::timeout(self.timeout, wire::read_packet(&mut conn))
                .await
                .map_err(|_| ClientError::Timeout)??;
            match packet {
                Some(Packet::PushData { data, .. }) => {
                    for d in data {
                        handler(d)?;
                    }
                }
                Some(Packet::StatusError(tx)) if tx.id == tx_id => return Err(ClientError::Status),
                Some(_) => return Err(ClientError::Protocol),
                // EOF ends the transaction
                None => return Ok(()),
            }
        }
    }

    /// Convenience wrapper collecting the reply records into a vector.
    pub async fn request_all(&self, requested_type: u8) -> Result<Vec<Data>, ClientError> {
        let mut out = Vec::new();
        self.request(requested_type, |d| {
            out.push(d);
            Ok(())
        })
        .await?;
        Ok(out)
    }

    /// Push data records to the daemon in a single-shot transaction.
    pub async fn push(&self, data: Vec<Data>) -> Result<(), ClientError> {
        let mut conn = self.connect().await?;
        self.send(
            &mut conn,
            &Packet::PushData {
                tx: TransactionId {
                    id: rand::random(),
                    seq_no: 0,
                },
                data,
            },
        )
        .await?;
        conn.shutdown().await?;
        Ok(())
    }

    /// Ask the daemon to switch its operation mode.
    pub async fn mode_switch(&self, mode: u8) -> Result<(), ClientError> {
        let mut conn = self.connect().await?;
        self.send(&mut conn, &Packet::ModeSwitch { mode }).await?;
        conn.shutdown().await?;
        Ok(())
    }

    /// Ask the daemon to rebind its listeners to the named interfaces.
    /// At most 16 names of up to 15 bytes each fit the table.
    pub async fn change_interfaces(&self, names: &[String]) -> Result<(), ClientError> {
        let mut ifaces = Box::new([0u8; wire::IFACE_TABLE_LEN]);
        for (slot, name) in names.iter().take(16).enumerate() {
            let bytes = name.as_bytes();
            let n = bytes.len().min(wire::IFNAMSIZ - 1);
            ifaces[slot * wire::IFNAMSIZ..slot * wire::IFNAMSIZ + n].copy_from_slice(&bytes[..n]);
        }
        let mut conn = self.connect().await?;
        self.send(&mut conn, &Packet::ChangeInterface { ifaces })
            .await?;
        conn.shutdown().await?;
        Ok(())
    }
}

/// Decode a ChangeInterface name table back into interface names.
pub fn iface_table_names(table: &[u8; wire::IFACE_TABLE_LEN]) -> Vec<String> {
    table
        .chunks(wire::IFNAMSIZ)
        .filter_map(|slot| {
            let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
            if end == 0 {
                return None;
            }
            std::str::from_utf8(&slot[..end]).ok().map(str::to_string)
        })
        .collect()
}
