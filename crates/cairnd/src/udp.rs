//! UDP transport — multicast listener sockets and datagram send helpers.
//!
//! One listener socket is bound per configured interface and joined to the
//! ff02::1 group. Outbound datagrams (announcements, requests, sync
//! pushes) use short-lived sockets configured for the target interface,
//! the way each send dials a fresh connection in the C lineage.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use cairn_core::wire::{Packet, MAX_DATAGRAM, MULTICAST_ADDR};
use cairn_core::HardwareAddr;

use crate::server::Server;

/// One bound multicast listener. Held by the server's listener set; the
/// private quit channel wakes and terminates the read loop.
pub struct UdpListener {
    pub ifname: String,
    pub index: u32,
    pub hwaddr: HardwareAddr,
    pub socket: Arc<UdpSocket>,
    quit: mpsc::Sender<()>,
}

impl UdpListener {
    /// Ask the read loop to stop. The socket closes once the loop drops
    /// its reference.
    pub fn shutdown(&self) {
        let _ = self.quit.try_send(());
    }
}

/// Get the OS interface index for a named network interface.
pub fn if_index(name: &str) -> Result<u32> {
    let name_cstr = std::ffi::CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}

/// Read the hardware address of a named interface from sysfs.
pub fn if_hwaddr(name: &str) -> Result<HardwareAddr> {
    let path = format!("/sys/class/net/{name}/address");
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    text.trim()
        .parse()
        .with_context(|| format!("parsing hardware address of '{name}'"))
}

/// The all-nodes multicast destination on a given interface.
pub fn multicast_dest(index: u32, port: u16) -> SocketAddr {
    let group: Ipv6Addr = MULTICAST_ADDR.parse().expect("fixed group address");
    SocketAddrV6::new(group, port, 0, index).into()
}

/// Create a UDP socket joined to the ff02::1 multicast group on one
/// interface, bound to the gossip port.
fn make_listener_socket(interface_index: u32, port: u16) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_only_v6(true).context("IPV6_V6ONLY")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
    socket.bind(&bind_addr.into()).context("bind()")?;

    let group: Ipv6Addr = MULTICAST_ADDR.parse().expect("fixed group address");
    socket
        .join_multicast_v6(&group, interface_index)
        .context("IPV6_JOIN_GROUP")?;

    Ok(socket.into())
}

/// Create a short-lived UDP socket suitable for sending to link-local and
/// multicast destinations scoped to `interface_index`.
pub async fn sender_socket(interface_index: u32) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket
        .set_multicast_if_v6(interface_index)
        .context("IPV6_MULTICAST_IF")?;
    // link-local only, do not route beyond this link
    socket
        .set_multicast_hops_v6(1)
        .context("IPV6_MULTICAST_HOPS")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0);
    socket.bind(&bind_addr.into()).context("bind()")?;
    UdpSocket::from_std(socket.into()).context("tokio UdpSocket")
}

/// Fire one packet at `dest` and drop the socket.
pub async fn send_oneshot(interface_index: u32, dest: SocketAddr, packet: &Packet) -> Result<()> {
    let socket = sender_socket(interface_index).await?;
    let bytes = packet.encode().context("encode packet")?;
    socket.send_to(&bytes, dest).await.context("send_to")?;
    Ok(())
}

/// Bind a listener on `ifname` and spawn its read loop.
pub fn spawn_listener(server: Arc<Server>, ifname: &str) -> Result<UdpListener> {
    let index = if_index(ifname)?;
    let hwaddr = if_hwaddr(ifname)?;
    let std_socket = make_listener_socket(index, server.config.udp_port)
        .with_context(|| format!("binding multicast listener on '{ifname}'"))?;
    let socket = Arc::new(UdpSocket::from_std(std_socket).context("tokio UdpSocket")?);
    let (quit_tx, mut quit_rx) = mpsc::channel(1);

    let listener = UdpListener {
        ifname: ifname.to_string(),
        index,
        hwaddr,
        socket: socket.clone(),
        quit: quit_tx,
    };

    let ifname = ifname.to_string();
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        tracing::info!(iface = %ifname, "udp listener starting");
        loop {
            tokio::select! {
                _ = quit_rx.recv() => {
                    tracing::info!(iface = %ifname, "udp listener stopping");
                    return;
                }
                result = socket.recv_from(&mut buf) => {
                    let (len, src) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(iface = %ifname, error = %e, "recv_from failed, udp reader shutting down");
                            return;
                        }
                    };
                    // only handle traffic scoped to our own interface
                    if let SocketAddr::V6(v6) = src {
                        if v6.scope_id() != 0 && v6.scope_id() != index {
                            continue;
                        }
                    }
                    let packet = match Packet::decode(&buf[..len]) {
                        Ok((p, _)) => p,
                        Err(e) => {
                            tracing::warn!(iface = %ifname, error = %e, "cannot parse datagram, discarding");
                            continue;
                        }
                    };
                    server.clone().handle_udp(&ifname, index, src, packet).await;
                }
            }
        }
    });

    Ok(listener)
}
