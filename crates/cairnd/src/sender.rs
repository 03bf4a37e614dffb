//! Chunked data sender.
//!
//! Drains a bounded channel of data records into PushData frames. Stream
//! clients get one record per frame ("single" mode); UDP targets get
//! frames packed greedily up to the payload budget, with a StatusTxEnd
//! carrying the final sequence count once the channel closes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use cairn_core::wire::{Data, Packet, Tlv, TransactionId};

/// Channel bound for data-sender feeds. A stalled consumer propagates
/// slowness to the store iterator instead of buffering unboundedly.
pub const SEND_QUEUE: usize = 100;

/// Where a serialized frame goes.
pub(crate) trait FrameSink {
    async fn emit(&mut self, frame: &[u8]) -> io::Result<()>;
}

pub(crate) struct StreamSink<W>(pub W);

impl<W: AsyncWrite + Unpin + Send> FrameSink for StreamSink<W> {
    async fn emit(&mut self, frame: &[u8]) -> io::Result<()> {
        self.0.write_all(frame).await?;
        self.0.flush().await
    }
}

pub(crate) struct UdpSink {
    pub socket: Arc<UdpSocket>,
    pub dest: SocketAddr,
}

impl FrameSink for UdpSink {
    async fn emit(&mut self, frame: &[u8]) -> io::Result<()> {
        self.socket.send_to(frame, self.dest).await.map(|_| ())
    }
}

/// Drain `rx` into PushData frames on `sink`.
///
/// `single` sends one record per frame and no terminating status (stream
/// transport); otherwise records are packed up to `max_payload` bytes per
/// frame and a final StatusTxEnd carries the chunk count.
pub(crate) async fn send_data<S: FrameSink>(
    sink: &mut S,
    tx_id: u16,
    mut rx: mpsc::Receiver<Data>,
    single: bool,
    max_payload: usize,
) -> io::Result<()> {
    let mut tx = TransactionId {
        id: tx_id,
        seq_no: 0,
    };
    let mut batch: Vec<Data> = Vec::new();
    let empty_size = Tlv::WIRE_SIZE + TransactionId::WIRE_SIZE;
    let mut size = empty_size;

    while let Some(d) = rx.recv().await {
        if !batch.is_empty() && (single || size + d.wire_size() > max_payload) {
            flush(sink, &mut tx, std::mem::take(&mut batch)).await?;
            size = empty_size;
        }
        size += d.wire_size();
        batch.push(d);
        if !single && size > max_payload {
            // a single record that cannot fit any frame
            tracing::warn!(tx_id, "data record too large, will not propagate");
            batch.clear();
            size = empty_size;
        }
    }
    if !batch.is_empty() {
        flush(sink, &mut tx, batch).await?;
    }
    if !single && tx.seq_no > 0 {
        let status = Packet::StatusTxEnd(tx).encode().expect("fixed-size status");
        sink.emit(&status).await?;
    }
    Ok(())
}

async fn flush<S: FrameSink>(
    sink: &mut S,
    tx: &mut TransactionId,
    batch: Vec<Data>,
) -> io::Result<()> {
    let frame = Packet::PushData { tx: *tx, data: batch }
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    sink.emit(&frame).await?;
    tx.seq_no += 1;
    Ok(())
}
