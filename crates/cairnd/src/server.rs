//! Server core — mode state machine, packet dispatch, background tasks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, oneshot};

use cairn_core::config::DaemonConfig;
use cairn_core::wire::{Mode, Packet, MAX_DATAGRAM, PACKETTYPE_ALL};
use cairn_core::HardwareAddr;

use crate::master::{self, MasterEntry, MasterTable};
use crate::sender::{self, UdpSink, SEND_QUEUE};
use crate::store::ContentStore;
use crate::transaction::{self, TransactionPolicy, TransactionTable};
use crate::udp::{self, UdpListener};

/// One running daemon instance.
pub struct Server {
    pub config: DaemonConfig,
    pub store: ContentStore,
    /// PushData frames are split once they would exceed this size.
    pub max_payload: usize,
    mode: AtomicU8,
    transactions: TransactionTable,
    masters: MasterTable,
    udp_listeners: Mutex<HashMap<String, UdpListener>>,
    /// Hardware address of the first bound interface; used as the source
    /// for local records pushed with the unset sentinel.
    first_interface: Mutex<Option<HardwareAddr>>,
    shutdown: broadcast::Sender<()>,
}

impl Server {
    /// Build a server and start its background tasks. Interfaces and
    /// stream listeners are bound separately.
    pub fn new(config: DaemonConfig) -> Arc<Server> {
        let (shutdown, _) = broadcast::channel(8);
        let mode = config.mode;
        let server = Arc::new(Server {
            store: ContentStore::new(config.store_ttl),
            max_payload: MAX_DATAGRAM - 8,
            mode: AtomicU8::new(mode),
            transactions: transaction::new_transaction_table(),
            masters: master::new_master_table(),
            udp_listeners: Mutex::new(HashMap::new()),
            first_interface: Mutex::new(None),
            shutdown,
            config,
        });
        server.clone().spawn_background_tasks();
        server
    }

    pub fn mode(&self) -> Mode {
        Mode::try_from(self.mode.load(Ordering::Relaxed)).unwrap_or(Mode::Slave)
    }

    pub fn set_mode(&self, mode: Mode) {
        tracing::info!(?mode, "switching operation mode");
        self.mode.store(mode as u8, Ordering::Relaxed);
    }

    pub fn policy(&self) -> TransactionPolicy {
        TransactionPolicy {
            wait_complete: self.config.wait_complete,
            drop_incomplete: self.config.drop_incomplete,
        }
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn first_interface(&self) -> Option<HardwareAddr> {
        *self.first_interface.lock().expect("first_interface lock")
    }

    pub fn preferred_master(&self) -> Option<MasterEntry> {
        master::preferred(&self.masters)
    }

    pub(crate) fn transactions(&self) -> &TransactionTable {
        &self.transactions
    }

    /// Stop background tasks and close every listener socket.
    pub fn shutdown(&self) {
        tracing::info!("shutting down");
        let _ = self.shutdown.send(());
        let listeners = self.udp_listeners.lock().expect("listener lock");
        for l in listeners.values() {
            l.shutdown();
        }
    }

    // ── Interfaces ───────────────────────────────────────────────────────────

    /// Bind a multicast listener on `ifname`. The first bound interface's
    /// hardware address becomes the source for anonymous local pushes.
    pub fn bind_interface(self: Arc<Self>, ifname: &str) -> Result<()> {
        let listener = udp::spawn_listener(self.clone(), ifname)?;
        {
            let mut first = self.first_interface.lock().expect("first_interface lock");
            if first.is_none() {
                *first = Some(listener.hwaddr);
            }
        }
        self.udp_listeners
            .lock()
            .expect("listener lock")
            .insert(ifname.to_string(), listener);
        Ok(())
    }

    /// Rebind the listener set to exactly `names`: close listeners that
    /// are no longer wanted, bind the new ones.
    pub fn rebind_interfaces(self: Arc<Self>, names: &[String]) {
        let to_close: Vec<String> = {
            let listeners = self.udp_listeners.lock().expect("listener lock");
            listeners
                .keys()
                .filter(|k| !names.contains(k))
                .cloned()
                .collect()
        };
        for name in to_close {
            if let Some(l) = self
                .udp_listeners
                .lock()
                .expect("listener lock")
                .remove(&name)
            {
                tracing::info!(iface = %name, "unbinding interface");
                l.shutdown();
            }
        }
        for name in names {
            let bound = self
                .udp_listeners
                .lock()
                .expect("listener lock")
                .contains_key(name);
            if !bound {
                if let Err(e) = self.clone().bind_interface(name) {
                    tracing::warn!(iface = %name, error = %e, "cannot bind interface");
                }
            }
        }
    }

    /// Snapshot of (ifname, index) pairs for the bound interfaces.
    fn listener_targets(&self) -> Vec<(String, u32)> {
        self.udp_listeners
            .lock()
            .expect("listener lock")
            .values()
            .map(|l| (l.ifname.clone(), l.index))
            .collect()
    }

    fn listener_index(&self, ifname: &str) -> u32 {
        self.udp_listeners
            .lock()
            .expect("listener lock")
            .get(ifname)
            .map(|l| l.index)
            .unwrap_or(0)
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Handle one datagram received on a multicast listener.
    pub(crate) async fn handle_udp(
        self: Arc<Self>,
        ifname: &str,
        index: u32,
        src: SocketAddr,
        packet: Packet,
    ) {
        match packet {
            Packet::AnnounceMaster => {
                tracing::debug!(%src, iface = %ifname, "master announcement");
                master::observe(&self.masters, src, ifname);
            }
            Packet::PushData { tx, data } => {
                tracing::debug!(id = tx.id, seq = tx.seq_no, records = data.len(), "push data");
                let t = transaction::get_or_start(
                    &self.transactions,
                    tx.id,
                    self.store.clone(),
                    false,
                    self.policy(),
                );
                t.feed(tx.seq_no, data).await;
            }
            Packet::StatusTxEnd(tx) => {
                let t = transaction::get_or_start(
                    &self.transactions,
                    tx.id,
                    self.store.clone(),
                    false,
                    self.policy(),
                );
                t.complete(tx.seq_no).await;
            }
            Packet::StatusError(tx) => {
                let t = transaction::get_or_start(
                    &self.transactions,
                    tx.id,
                    self.store.clone(),
                    false,
                    self.policy(),
                );
                t.abort().await;
            }
            Packet::Request {
                requested_type,
                tx_id,
            } => {
                tracing::debug!(%src, requested_type, "request");
                self.spawn_udp_push(index, src, tx_id, requested_type, false);
            }
            other => {
                tracing::debug!(%src, kind = other.kind(), "ignoring packet on udp");
            }
        }
    }

    /// Spawn a chunked push of matching store records to a UDP peer.
    pub(crate) fn spawn_udp_push(
        self: Arc<Self>,
        index: u32,
        dest: SocketAddr,
        tx_id: u16,
        type_filter: u8,
        local_only: bool,
    ) {
        tokio::spawn(async move {
            let socket = match udp::sender_socket(index).await {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    tracing::warn!(%dest, error = %e, "cannot open sender socket");
                    return;
                }
            };
            let (tx, rx) = mpsc::channel(SEND_QUEUE);
            let max_payload = self.max_payload;
            let sender = tokio::spawn(async move {
                let mut sink = UdpSink { socket, dest };
                if let Err(e) = sender::send_data(&mut sink, tx_id, rx, false, max_payload).await {
                    tracing::warn!(%dest, error = %e, "error sending data");
                }
            });
            self.store.send_all(type_filter, local_only, tx).await;
            let _ = sender.await;
        });
    }

    // ── Background tasks ─────────────────────────────────────────────────────

    fn spawn_background_tasks(self: Arc<Self>) {
        self.clone().spawn_master_purge();
        self.clone().spawn_transaction_purge();
        self.clone().spawn_store_purge();
        self.clone().spawn_announce();
        self.spawn_sync();
    }

    fn spawn_master_purge(self: Arc<Self>) {
        let mut quit = self.subscribe_shutdown();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.master_purge_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = quit.recv() => return,
                    _ = interval.tick() => {
                        master::purge_aged(&self.masters, self.config.master_max_age);
                    }
                }
            }
        });
    }

    fn spawn_transaction_purge(self: Arc<Self>) {
        let mut quit = self.subscribe_shutdown();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.transaction_purge_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = quit.recv() => return,
                    _ = interval.tick() => {
                        transaction::purge_aged(
                            &self.transactions,
                            self.config.transaction_max_age,
                        ).await;
                    }
                }
            }
        });
    }

    fn spawn_store_purge(self: Arc<Self>) {
        let mut quit = self.subscribe_shutdown();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.store_purge_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = quit.recv() => return,
                    _ = interval.tick() => {
                        let purged = self.store.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "expired store records");
                        }
                    }
                }
            }
        });
    }

    /// Master modes announce their presence: a real master multicasts on
    /// every bound interface, a stealth master unicasts to its preferred
    /// master only.
    fn spawn_announce(self: Arc<Self>) {
        let mut quit = self.subscribe_shutdown();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.announcement_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = quit.recv() => return,
                    _ = interval.tick() => match self.mode() {
                        Mode::Master => {
                            for (ifname, index) in self.listener_targets() {
                                let dest = udp::multicast_dest(index, self.config.udp_port);
                                tracing::debug!(iface = %ifname, "announce");
                                if let Err(e) =
                                    udp::send_oneshot(index, dest, &Packet::AnnounceMaster).await
                                {
                                    tracing::warn!(%dest, error = %e, "cannot send announcement");
                                }
                            }
                        }
                        Mode::StealthMaster => {
                            if let Some(m) = self.preferred_master() {
                                let index = self.listener_index(&m.iface);
                                tracing::debug!(dest = %m.addr, "announce (stealth)");
                                if let Err(e) =
                                    udp::send_oneshot(index, m.addr, &Packet::AnnounceMaster).await
                                {
                                    tracing::warn!(dest = %m.addr, error = %e, "cannot send announcement");
                                }
                            }
                        }
                        Mode::Slave => {}
                    }
                }
            }
        });
    }

    /// Periodic data synchronization: slaves and stealth masters push
    /// their local records to the preferred master, masters push
    /// everything they have to every bound interface.
    fn spawn_sync(self: Arc<Self>) {
        let mut quit = self.subscribe_shutdown();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sync_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = quit.recv() => return,
                    _ = interval.tick() => match self.mode() {
                        Mode::Slave | Mode::StealthMaster => {
                            if let Some(m) = self.preferred_master() {
                                tracing::debug!(dest = %m.addr, "syncing local records to master");
                                let index = self.listener_index(&m.iface);
                                self.clone().spawn_udp_push(
                                    index,
                                    m.addr,
                                    rand::random(),
                                    PACKETTYPE_ALL,
                                    true,
                                );
                            }
                        }
                        Mode::Master => {
                            for (ifname, index) in self.listener_targets() {
                                tracing::debug!(iface = %ifname, "syncing all records");
                                let dest = udp::multicast_dest(index, self.config.udp_port);
                                self.clone().spawn_udp_push(
                                    index,
                                    dest,
                                    rand::random(),
                                    PACKETTYPE_ALL,
                                    false,
                                );
                            }
                        }
                    }
                }
            }
        });
    }

    // ── Forwarded requests ───────────────────────────────────────────────────

    /// Forward a client request to the preferred master and wait for the
    /// answering transaction to commit. Returns false on timeout or when
    /// no master is known.
    pub(crate) async fn forward_request(&self, requested_type: u8) -> bool {
        let Some(m) = self.preferred_master() else {
            tracing::warn!("got a request but know of no master");
            return false;
        };
        let (done_tx, done_rx) = oneshot::channel();
        let id = transaction::initiate(
            &self.transactions,
            self.store.clone(),
            done_tx,
            self.policy(),
        );
        let index = self.listener_index(&m.iface);
        tracing::debug!(dest = %m.addr, requested_type, "forwarding request to master");
        if let Err(e) = udp::send_oneshot(
            index,
            m.addr,
            &Packet::Request {
                requested_type,
                tx_id: id,
            },
        )
        .await
        {
            tracing::warn!(dest = %m.addr, error = %e, "cannot forward request");
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.config.wait_master_reply) => {
                tracing::warn!("timeout waiting for reply to forwarded request");
                false
            }
            result = done_rx => result.is_ok(),
        }
    }
}
