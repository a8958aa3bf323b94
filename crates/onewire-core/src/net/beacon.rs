//! UDP multicast discovery.
//!
//! The beacon listens on the discovery group and answers every datagram
//! that equals the expected payload (the protocol version as a big-endian
//! `i32`) with the version, the proxy's TCP port and a sentinel byte.
//! [`discover`] is the matching client.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, info, trace, warn};

use super::constants::{BEACON_SENTINEL, PROTOCOL_VERSION};
use super::server::is_timeout_error;
use crate::error::Result;

/// Receive timeout; bounds how long `stop` waits for the thread.
const RECV_TIMEOUT: Duration = Duration::from_millis(200);

const REPLY_LEN: usize = 9;

/// Datagram a client multicasts to find proxies.
pub fn discovery_payload() -> [u8; 4] {
    PROTOCOL_VERSION.to_be_bytes()
}

fn reply_payload(tcp_port: u16) -> [u8; REPLY_LEN] {
    let mut reply = [0u8; REPLY_LEN];
    BigEndian::write_i32(&mut reply[0..4], PROTOCOL_VERSION);
    BigEndian::write_i32(&mut reply[4..8], i32::from(tcp_port));
    reply[8] = BEACON_SENTINEL;
    reply
}

/// Proxy port announced in a reply, if the reply is well formed.
fn parse_reply(reply: &[u8]) -> Option<u16> {
    if reply.len() != REPLY_LEN || reply[8] != BEACON_SENTINEL {
        return None;
    }
    if BigEndian::read_i32(&reply[0..4]) != PROTOCOL_VERSION {
        return None;
    }
    u16::try_from(BigEndian::read_i32(&reply[4..8])).ok()
}

/// Background responder advertising one proxy server.
pub struct DiscoveryBeacon {
    local_port: u16,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DiscoveryBeacon {
    /// Bind `port`, join `group` and start answering for `tcp_port`.
    ///
    /// Failing to join the group is logged and the beacon still answers
    /// datagrams sent straight to its port.
    pub fn start(group: Ipv4Addr, port: u16, tcp_port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
        if let Err(e) = socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
            warn!(group = %group, error = %e, "Could not join discovery multicast group");
        }
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        let local_port = socket.local_addr()?.port();

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("owbridge-beacon".to_string())
            .spawn(move || beacon_loop(socket, tcp_port, flag))?;

        info!(group = %group, port = local_port, tcp_port, "Discovery beacon listening");
        Ok(Self {
            local_port,
            running,
            thread: Some(thread),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Discovery beacon thread panicked");
        }
    }
}

impl Drop for DiscoveryBeacon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn beacon_loop(socket: UdpSocket, tcp_port: u16, running: Arc<AtomicBool>) {
    let expected = discovery_payload();
    let reply = reply_payload(tcp_port);
    let mut buf = [0u8; 512];

    while running.load(Ordering::Acquire) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) => {
                warn!(error = %e, "Discovery receive failed");
                continue;
            }
        };
        if buf[..len] != expected {
            trace!(peer = %src, len, "Ignoring unexpected discovery datagram");
            continue;
        }
        debug!(peer = %src, "Answering discovery request");
        if let Err(e) = socket.send_to(&reply, src) {
            warn!(peer = %src, error = %e, "Discovery reply failed");
        }
    }
    info!("Discovery beacon stopped");
}

/// Send a discovery request to `target` (normally the multicast group) and
/// collect the proxies that answer within `timeout`.
pub fn discover(target: SocketAddr, timeout: Duration) -> Result<Vec<SocketAddr>> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
    socket.send_to(&discovery_payload(), target)?;

    let deadline = Instant::now() + timeout;
    let mut found = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        socket.set_read_timeout(Some(remaining))?;
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if is_timeout_error(&e) => break,
            Err(e) => return Err(e.into()),
        };
        match parse_reply(&buf[..len]) {
            Some(port) => {
                let proxy = SocketAddr::new(src.ip(), port);
                if !found.contains(&proxy) {
                    debug!(proxy = %proxy, "Discovered proxy");
                    found.push(proxy);
                }
            }
            None => trace!(peer = %src, len, "Ignoring malformed discovery reply"),
        }
    }
    Ok(found)
}
