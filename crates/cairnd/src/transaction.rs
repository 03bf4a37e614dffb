//! Push-transaction assembly.
//!
//! Every transaction is owned by one spawned task; the rest of the daemon
//! talks to it through the channels in its handle. Chunks may arrive in
//! any order, including the final-sequence marker before earlier chunks,
//! so completion arms a grace deadline before gaps are treated as fatal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use cairn_core::wire::Data;

use crate::store::ContentStore;

/// Policy knobs a transaction task needs, copied out of the daemon config.
#[derive(Debug, Clone, Copy)]
pub struct TransactionPolicy {
    /// Grace period after the final-sequence marker before gaps count.
    pub wait_complete: Duration,
    /// Discard transactions with gaps instead of committing partially.
    pub drop_incomplete: bool,
}

/// Handle to a live transaction task. Cheap to clone.
#[derive(Clone)]
pub struct TransactionHandle {
    pub started: Instant,
    feed: mpsc::Sender<(u16, Vec<Data>)>,
    complete: mpsc::Sender<u16>,
    abort: mpsc::Sender<()>,
}

impl TransactionHandle {
    /// Store a chunk under its sequence number. Last write wins on a
    /// duplicate sequence number.
    pub async fn feed(&self, seq_no: u16, data: Vec<Data>) {
        let _ = self.feed.send((seq_no, data)).await;
    }

    /// Signal the final sequence count (from StatusTxEnd).
    pub async fn complete(&self, final_seq: u16) {
        let _ = self.complete.send(final_seq).await;
    }

    /// Discard the transaction (StatusError or age-out).
    pub async fn abort(&self) {
        let _ = self.abort.send(()).await;
    }
}

/// All live transactions, keyed by wire id.
pub type TransactionTable = Arc<DashMap<u16, TransactionHandle>>;

pub fn new_transaction_table() -> TransactionTable {
    Arc::new(DashMap::new())
}

/// Look up a transaction, starting one if this id is new.
pub fn get_or_start(
    table: &TransactionTable,
    id: u16,
    store: ContentStore,
    is_local: bool,
    policy: TransactionPolicy,
) -> TransactionHandle {
    table
        .entry(id)
        .or_insert_with(|| spawn_transaction(table.clone(), id, store, is_local, None, policy))
        .clone()
}

/// Start a locally-initiated transaction (for a forwarded request).
/// The id is drawn by rejection sampling against the live table; `done`
/// fires once when the transaction commits.
pub fn initiate(
    table: &TransactionTable,
    store: ContentStore,
    done: oneshot::Sender<()>,
    policy: TransactionPolicy,
) -> u16 {
    loop {
        let id: u16 = rand::random();
        let entry = table.entry(id);
        if let dashmap::mapref::entry::Entry::Vacant(vacant) = entry {
            vacant.insert(spawn_transaction(
                table.clone(),
                id,
                store,
                false,
                Some(done),
                policy,
            ));
            return id;
        }
    }
}

fn spawn_transaction(
    table: TransactionTable,
    id: u16,
    store: ContentStore,
    is_local: bool,
    done: Option<oneshot::Sender<()>>,
    policy: TransactionPolicy,
) -> TransactionHandle {
    let (feed_tx, mut feed_rx) = mpsc::channel::<(u16, Vec<Data>)>(16);
    let (complete_tx, mut complete_rx) = mpsc::channel::<u16>(4);
    let (abort_tx, mut abort_rx) = mpsc::channel::<()>(1);
    let handle = TransactionHandle {
        started: Instant::now(),
        feed: feed_tx,
        complete: complete_tx,
        abort: abort_tx,
    };

    tokio::spawn(async move {
        let mut chunks: HashMap<u16, Vec<Data>> = HashMap::new();
        let mut final_seq: Option<u16> = None;
        // armed once the final marker arrived with gaps still open
        let grace = tokio::time::sleep(Duration::MAX);
        tokio::pin!(grace);
        let mut grace_armed = false;

        let committed = loop {
            tokio::select! {
                _ = abort_rx.recv() => break false,

                Some(final_count) = complete_rx.recv() => {
                    final_seq = Some(final_count);
                    if gap_free(&chunks, final_count) {
                        break true;
                    }
                    grace.as_mut().reset(tokio::time::Instant::now() + policy.wait_complete);
                    grace_armed = true;
                }

                Some((seq_no, data)) = feed_rx.recv() => {
                    chunks.insert(seq_no, data);
                }

                _ = &mut grace, if grace_armed => {
                    let final_count = final_seq.unwrap_or(0);
                    if gap_free(&chunks, final_count) {
                        break true;
                    }
                    if policy.drop_incomplete {
                        tracing::warn!(id, "dropping incomplete transaction");
                        break false;
                    }
                    break true;
                }
            }
        };

        if committed {
            let mut records = 0usize;
            for data in chunks.into_values() {
                for d in data {
                    store.put(d, is_local);
                    records += 1;
                }
            }
            tracing::debug!(id, records, "transaction committed");
            if let Some(done) = done {
                // waiter may be gone already; that's fine
                let _ = done.send(());
            }
        }

        table.remove(&id);
        tracing::debug!(id, "finished transaction");
    });

    handle
}

fn gap_free(chunks: &HashMap<u16, Vec<Data>>, final_count: u16) -> bool {
    (0..final_count).all(|seq| chunks.contains_key(&seq))
}

/// Sweep loop body: abort transactions older than `max_age`.
pub async fn purge_aged(table: &TransactionTable, max_age: Duration) {
    let aged: Vec<(u16, TransactionHandle)> = table
        .iter()
        .filter(|e| e.started.elapsed() > max_age)
        .map(|e| (*e.key(), e.value().clone()))
        .collect();
    for (id, handle) in aged {
        tracing::warn!(id, "transaction timed out unfinished");
        handle.abort().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use cairn_core::HardwareAddr;
    use tokio::sync::mpsc::error::TryRecvError;

    fn record(kind: u8, payload: &[u8]) -> Data {
        Data::new(
            HardwareAddr([9; 6]),
            kind,
            0,
            Bytes::copy_from_slice(payload),
        )
    }

    fn policy() -> TransactionPolicy {
        TransactionPolicy {
            wait_complete: Duration::from_millis(50),
            drop_incomplete: true,
        }
    }

    async fn store_records(store: &ContentStore) -> usize {
        let (tx, mut rx) = mpsc::channel(100);
        store
            .send_all(cairn_core::wire::PACKETTYPE_ALL, false, tx)
            .await;
        let mut n = 0;
        while rx.recv().await.is_some() {
            n += 1;
        }
        n
    }

    async fn wait_for_close(table: &TransactionTable, id: u16) {
        for _ in 0..100 {
            if !table.contains_key(&id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transaction {id} never closed");
    }

    #[tokio::test]
    async fn complete_transaction_commits_all_records() {
        let table = new_transaction_table();
        let store = ContentStore::new(Duration::from_secs(60));
        let t = get_or_start(&table, 7, store.clone(), false, policy());
        t.feed(0, vec![record(158, b"a"), record(159, b"b")]).await;
        t.feed(1, vec![record(1, b"c")]).await;
        t.complete(2).await;
        wait_for_close(&table, 7).await;
        assert_eq!(store_records(&store).await, 3);
    }

    #[tokio::test]
    async fn marker_before_chunks_still_commits() {
        let table = new_transaction_table();
        let store = ContentStore::new(Duration::from_secs(60));
        let t = get_or_start(&table, 8, store.clone(), false, policy());
        t.complete(2).await;
        t.feed(1, vec![record(158, b"late")]).await;
        t.feed(0, vec![record(158, b"later")]).await;
        // the grace deadline picks up the now-complete set
        wait_for_close(&table, 8).await;
        assert_eq!(store_records(&store).await, 2);
    }

    #[tokio::test]
    async fn gap_drops_everything_when_drop_incomplete() {
        let table = new_transaction_table();
        let store = ContentStore::new(Duration::from_secs(60));
        let t = get_or_start(&table, 9, store.clone(), false, policy());
        t.feed(0, vec![record(158, b"a")]).await;
        t.feed(2, vec![record(158, b"b")]).await;
        t.complete(3).await;
        wait_for_close(&table, 9).await;
        assert_eq!(store_records(&store).await, 0);
    }

    #[tokio::test]
    async fn gap_commits_partial_when_policy_allows() {
        let table = new_transaction_table();
        let store = ContentStore::new(Duration::from_secs(60));
        let lenient = TransactionPolicy {
            drop_incomplete: false,
            ..policy()
        };
        let t = get_or_start(&table, 10, store.clone(), false, lenient);
        t.feed(0, vec![record(158, b"a")]).await;
        t.complete(2).await;
        wait_for_close(&table, 10).await;
        assert_eq!(store_records(&store).await, 1);
    }

    #[tokio::test]
    async fn abort_discards() {
        let table = new_transaction_table();
        let store = ContentStore::new(Duration::from_secs(60));
        let t = get_or_start(&table, 11, store.clone(), false, policy());
        t.feed(0, vec![record(158, b"a")]).await;
        t.abort().await;
        wait_for_close(&table, 11).await;
        assert_eq!(store_records(&store).await, 0);
    }

    #[tokio::test]
    async fn initiate_signals_done_once() {
        let table = new_transaction_table();
        let store = ContentStore::new(Duration::from_secs(60));
        let (done_tx, mut done_rx) = oneshot::channel();
        let id = initiate(&table, store.clone(), done_tx, policy());
        assert!(table.contains_key(&id));
        assert_eq!(done_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty));
        let t = table.get(&id).unwrap().clone();
        t.feed(0, vec![record(158, b"a")]).await;
        t.complete(1).await;
        wait_for_close(&table, id).await;
        assert_eq!(done_rx.await, Ok(()));
    }

    #[tokio::test]
    async fn purge_aged_aborts_stale_transactions() {
        let table = new_transaction_table();
        let store = ContentStore::new(Duration::from_secs(60));
        let t = get_or_start(&table, 12, store.clone(), false, policy());
        t.feed(0, vec![record(158, b"a")]).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        purge_aged(&table, Duration::from_millis(1)).await;
        wait_for_close(&table, 12).await;
        assert_eq!(store_records(&store).await, 0);
    }

    #[tokio::test]
    async fn duplicate_seq_last_write_wins() {
        let table = new_transaction_table();
        let store = ContentStore::new(Duration::from_secs(60));
        let t = get_or_start(&table, 13, store.clone(), false, policy());
        t.feed(0, vec![record(158, b"first"), record(159, b"x")]).await;
        t.feed(0, vec![record(158, b"second")]).await;
        t.complete(1).await;
        wait_for_close(&table, 13).await;
        assert_eq!(store_records(&store).await, 1);
        let (tx, mut rx) = mpsc::channel(10);
        store.send_all(158, false, tx).await;
        let d = rx.recv().await.unwrap();
        assert_eq!(&d.payload[..], b"second");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }
}
