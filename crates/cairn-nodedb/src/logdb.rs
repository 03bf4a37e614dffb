//! Count logging: client and node counts over time, delta-only.
//!
//! A sample is only written when its count differs from the last
//! recorded one for that key, so flat periods cost one entry. Sentinels:
//! -1 for "offline at this sampling time", -2 for "data present but
//! unparseable". The rollup turns raw samples into equally sized
//! buckets with min/max/time-weighted-average plus the bucket-time
//! fractions spent offline and erroneous.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use cairn_core::HardwareAddr;

use crate::export::JsonTime;
use crate::items::{Count, StatisticsItem, COUNT_ERRORNEOUS, COUNT_OFFLINE};
use crate::nodedb::{resolve_alias_read, NodeDb};
use crate::store::{now_stamp, Bucket, Notification, Stamp};
use crate::update::{UpdateEvent, Updaters};

// ── Writing ───────────────────────────────────────────────────────────────────

impl NodeDb {
    /// Append a count sample unless it repeats the latest recorded count
    /// at or before `timestamp`. Returns whether a write happened.
    pub fn log_count(&self, bucket: &Bucket, timestamp: Stamp, count: i64) -> bool {
        self.logs.update(|tx| {
            let mut last: Option<i64> = None;
            tx.for_each_reverse(bucket, |key, _, content| {
                let Some(sample) = Count::from_entry(key, content) else {
                    return true;
                };
                if sample.timestamp <= timestamp {
                    last = Some(sample.count);
                    return false;
                }
                true
            });
            if last == Some(count) {
                return false;
            }
            tracing::debug!(bucket = %bucket.name(), count, "new count sample");
            let sample = Count { timestamp, count };
            tx.put(bucket, &Count::key(timestamp), &sample.to_bytes(), None);
            true
        })
    }

    /// Remove one sample by timestamp. Returns whether it existed.
    pub fn delete_log_sample(&self, bucket: &Bucket, timestamp: Stamp) -> bool {
        self.logs
            .update(|tx| tx.delete(bucket, &Count::key(timestamp)))
    }

    /// All samples of one key, oldest first.
    pub fn log_data(&self, bucket: &Bucket) -> Vec<Count> {
        let mut out = Vec::new();
        self.logs.view(|tx| {
            tx.for_each(bucket, |key, _, content| {
                if let Some(sample) = Count::from_entry(key, content) {
                    out.push(sample);
                }
                true
            });
        });
        out
    }

    /// MAC strings of the nodes that have a sample bucket.
    pub fn log_node_keys(&self) -> Vec<String> {
        let mut keys = self.logs.view(|tx| tx.node_bucket_names());
        keys.sort();
        keys
    }

    /// One sampling pass: per-node wifi client counts plus the two
    /// mesh-wide totals. Nodes whose statistics fail to decode get the
    /// erroneous sentinel.
    pub fn log_sample_pass(&self) {
        let now = now_stamp();
        let offline_after = self.settings.offline_after.as_millis() as i64;
        let mut nodes = 0i64;
        let mut clients = 0i64;
        let mut per_node: Vec<(String, i64)> = Vec::new();

        self.main.view(|tx| {
            tx.for_each(&Bucket::Statistics, |key, meta, content| {
                if now - meta.updated >= offline_after {
                    return true;
                }
                let canonical = match HardwareAddr::from_bytes(key) {
                    Some(addr) => resolve_alias_read(tx, addr),
                    None => return true,
                };
                match StatisticsItem::from_bytes(content) {
                    Ok(stats) => {
                        nodes += 1;
                        let c = stats.data.clients.unwrap_or_default();
                        clients += c.total;
                        per_node.push((canonical.to_string(), c.wifi));
                    }
                    Err(_) => {
                        per_node.push((canonical.to_string(), COUNT_ERRORNEOUS));
                    }
                }
                true
            });
        });

        tracing::info!(nodes, clients, "sampling pass");
        for (mac, wifi) in per_node {
            self.log_count(&Bucket::NodeClients(mac), now, wifi);
        }
        self.log_count(&Bucket::MeshClients, now, clients);
        self.log_count(&Bucket::MeshNodes, now, nodes);
    }
}

// ── Sampler task ──────────────────────────────────────────────────────────────

/// Drive sampling from the update stream: one pass at a time, at most
/// one follow-up queued while a pass runs. Purged vis records mark
/// their node offline.
pub fn spawn_logger(db: Arc<NodeDb>, updaters: &Updaters) {
    let mut stats_events = updaters.subscribe();
    let mut store_events = db.main.subscribe();
    // capacity 1 gives the single-queued-follow-up semantics for free
    let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);

    {
        let db = db.clone();
        tokio::spawn(async move {
            while trigger_rx.recv().await.is_some() {
                let db = db.clone();
                // sampling walks the whole statistics bucket
                let _ = tokio::task::spawn_blocking(move || db.log_sample_pass()).await;
            }
        });
    }

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = stats_events.recv() => match event {
                    Ok(UpdateEvent::Statistics) => {
                        let _ = trigger_tx.try_send(());
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let _ = trigger_tx.try_send(());
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                event = store_events.recv() => match event {
                    Ok(Notification::Purge { bucket: Bucket::VisData, key }) => {
                        // purged vis data means the node is offline
                        if let Some(addr) = HardwareAddr::from_bytes(&key) {
                            db.log_count(
                                &Bucket::NodeClients(addr.to_string()),
                                now_stamp(),
                                COUNT_OFFLINE,
                            );
                        }
                    }
                    Ok(Notification::Quit) | Err(broadcast::error::RecvError::Closed) => return,
                    _ => {}
                },
            }
        }
    });
}

// ── Rollup ────────────────────────────────────────────────────────────────────

/// One rolled-up bucket of samples.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LogSample {
    /// End of the bucket's time range.
    pub time: JsonTime,
    pub min: i64,
    pub max: i64,
    pub avg: f64,
    /// Fraction of the bucket spent offline (or before logged history).
    pub offline: f64,
    /// Fraction of the bucket with unparseable data.
    pub errorneous: f64,
}

impl NodeDb {
    /// Roll samples up into `samples` equally sized buckets covering
    /// `duration` back from `start`, oldest bucket first.
    pub fn log_samples(
        &self,
        bucket: &Bucket,
        start: Stamp,
        duration: Duration,
        samples: usize,
    ) -> Vec<LogSample> {
        if samples == 0 {
            return Vec::new();
        }
        let counts = self.log_data(bucket);
        let bucket_ms = (duration.as_millis() as i64 / samples as i64).max(1);
        let mut out = Vec::with_capacity(samples);
        for i in 0..samples {
            let end = start - (samples - 1 - i) as i64 * bucket_ms;
            let begin = end - bucket_ms;
            out.push(rollup_range(&counts, begin, end));
        }
        out
    }
}

/// The count in effect at time `t`: the latest sample at or before it.
/// `None` means `t` precedes logged history.
fn value_at(counts: &[Count], t: Stamp) -> Option<i64> {
    match counts.partition_point(|c| c.timestamp <= t) {
        0 => None,
        n => Some(counts[n - 1].count),
    }
}

fn rollup_range(counts: &[Count], begin: Stamp, end: Stamp) -> LogSample {
    let total = (end - begin) as f64;
    let mut sample = LogSample {
        time: JsonTime(end),
        min: i64::MAX,
        max: i64::MIN,
        ..Default::default()
    };
    let mut weighted_sum = 0.0;
    let mut counted_time = 0.0;
    let mut offline_time = 0.0;
    let mut error_time = 0.0;

    // walk the step function over [begin, end): segment boundaries are
    // the sample timestamps inside the range
    let mut t = begin;
    let mut value = value_at(counts, begin);
    let first_inside = counts.partition_point(|c| c.timestamp <= begin);
    for c in &counts[first_inside..] {
        if c.timestamp >= end {
            break;
        }
        account(
            value,
            (c.timestamp - t) as f64,
            &mut sample,
            &mut weighted_sum,
            &mut counted_time,
            &mut offline_time,
            &mut error_time,
        );
        t = c.timestamp;
        value = Some(c.count);
    }
    account(
        value,
        (end - t) as f64,
        &mut sample,
        &mut weighted_sum,
        &mut counted_time,
        &mut offline_time,
        &mut error_time,
    );

    if counted_time > 0.0 {
        sample.avg = weighted_sum / counted_time;
    }
    if sample.min > sample.max {
        sample.min = 0;
        sample.max = 0;
    }
    sample.offline = offline_time / total;
    sample.errorneous = error_time / total;
    sample
}

fn account(
    value: Option<i64>,
    dt: f64,
    sample: &mut LogSample,
    weighted_sum: &mut f64,
    counted_time: &mut f64,
    offline_time: &mut f64,
    error_time: &mut f64,
) {
    if dt <= 0.0 {
        return;
    }
    match value {
        // before any logged sample counts as fully offline
        None | Some(COUNT_OFFLINE) => *offline_time += dt,
        Some(COUNT_ERRORNEOUS) => *error_time += dt,
        Some(v) => {
            *weighted_sum += v as f64 * dt;
            *counted_time += dt;
            sample.min = sample.min.min(v);
            sample.max = sample.max.max(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gluon::{Clients, StatisticsData};
    use crate::nodedb::test_settings;

    #[tokio::test]
    async fn log_count_is_delta_only() {
        let db = NodeDb::new(test_settings());
        let bucket = Bucket::MeshClients;
        assert!(db.log_count(&bucket, 1_000, 5));
        assert!(!db.log_count(&bucket, 2_000, 5));
        assert!(db.log_count(&bucket, 3_000, 7));
        assert!(db.log_count(&bucket, 4_000, 5));
        let data = db.log_data(&bucket);
        let counts: Vec<i64> = data.iter().map(|c| c.count).collect();
        assert_eq!(counts, vec![5, 7, 5]);
    }

    #[tokio::test]
    async fn delete_removes_one_sample() {
        let db = NodeDb::new(test_settings());
        let bucket = Bucket::MeshNodes;
        db.log_count(&bucket, 1_000, 1);
        db.log_count(&bucket, 2_000, 2);
        assert!(db.delete_log_sample(&bucket, 1_000));
        assert!(!db.delete_log_sample(&bucket, 1_000));
        assert_eq!(db.log_data(&bucket).len(), 1);
    }

    #[tokio::test]
    async fn sample_pass_counts_nodes_and_clients() {
        let db = NodeDb::new(test_settings());
        for (last, wifi, total) in [(1u8, 2i64, 4i64), (2, 1, 3)] {
            db.update_statistics(&StatisticsItem {
                source: HardwareAddr([2, 0, 0, 0, 0, last]),
                data: StatisticsData {
                    clients: Some(Clients { wifi, total }),
                    ..Default::default()
                },
            });
        }
        db.log_sample_pass();
        assert_eq!(db.log_data(&Bucket::MeshNodes).last().unwrap().count, 2);
        assert_eq!(db.log_data(&Bucket::MeshClients).last().unwrap().count, 7);
        let keys = db.log_node_keys();
        assert_eq!(keys.len(), 2);
        let node = db.log_data(&Bucket::NodeClients(keys[0].clone()));
        assert_eq!(node.last().unwrap().count, 2);
    }

    #[tokio::test]
    async fn rollup_weights_by_time_and_tracks_sentinels() {
        let db = NodeDb::new(test_settings());
        let bucket = Bucket::MeshClients;
        // value 10 from t=0, 20 from t=500, offline from t=750
        db.log_count(&bucket, 0, 10);
        db.log_count(&bucket, 500, 20);
        db.log_count(&bucket, 750, COUNT_OFFLINE);
        let samples = db.log_samples(&bucket, 1_000, Duration::from_millis(1_000), 1);
        assert_eq!(samples.len(), 1);
        let s = samples[0];
        assert_eq!(s.min, 10);
        assert_eq!(s.max, 20);
        // 10 for 500ms and 20 for 250ms over 750ms of counted time
        assert!((s.avg - (10.0 * 500.0 + 20.0 * 250.0) / 750.0).abs() < 1e-9);
        assert!((s.offline - 0.25).abs() < 1e-9);
        assert_eq!(s.errorneous, 0.0);
    }

    #[tokio::test]
    async fn rollup_before_history_is_fully_offline() {
        let db = NodeDb::new(test_settings());
        let bucket = Bucket::MeshClients;
        db.log_count(&bucket, 10_000, 5);
        let samples = db.log_samples(&bucket, 10_000, Duration::from_millis(10_000), 2);
        assert_eq!(samples.len(), 2);
        // first bucket [0, 5000) is entirely before the first sample
        assert!((samples[0].offline - 1.0).abs() < 1e-9);
        assert_eq!(samples[0].min, 0);
        // second bucket [5000, 10000) is also pre-history
        assert!((samples[1].offline - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rollup_erroneous_fraction() {
        let db = NodeDb::new(test_settings());
        let bucket = Bucket::NodeClients("02:00:00:00:00:01".into());
        db.log_count(&bucket, 0, 3);
        db.log_count(&bucket, 900, COUNT_ERRORNEOUS);
        let samples = db.log_samples(&bucket, 1_000, Duration::from_millis(1_000), 1);
        assert!((samples[0].errorneous - 0.1).abs() < 1e-9);
        assert_eq!(samples[0].min, 3);
        assert_eq!(samples[0].max, 3);
    }
}
