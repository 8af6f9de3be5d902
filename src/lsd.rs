//! Local Service Discovery (BEP-14): finding swarm members on the local
//! network over UDP multicast.
//!
//! Torrents announce their info hash to the multicast group and the listener
//! half turns announces from other hosts into peers for the matching
//! torrent. Private torrents neither broadcast nor accept LSD peers. The
//! message is HTTP-shaped:
//!
//! ```text
//! BT-SEARCH * HTTP/1.1\r\n
//! Host: 239.192.152.143:6771\r\n
//! Port: 6881\r\n
//! Infohash: <40 uppercase hex>\r\n
//! cookie: <local instance tag>\r\n
//! \r\n\r\n
//! ```
//!
//! The cookie tags our own instance so that multicast loopback of our own
//! announces is dropped instead of re-adding ourselves.

use std::{
    collections::HashSet,
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    os::unix::io::FromRawFd,
    time::Duration,
};

use rand::Rng;
use tokio::{
    net::UdpSocket,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time,
};

use crate::{
    engine::TorrentRegistry, info_hash_hex, tracker::PeerInfo, InfoHash,
};

/// The IPv4 multicast endpoint assigned to LSD.
const MULTICAST_V4: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 192, 152, 143), 6771);

/// How often registered torrents are re-announced to the group.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub(crate) type CommandSender = UnboundedSender<Command>;
type CommandReceiver = UnboundedReceiver<Command>;

pub(crate) enum Command {
    /// Broadcasts the torrent and keeps re-announcing it periodically while
    /// it stays registered in the engine.
    Announce(InfoHash),
    Shutdown,
}

/// The handle through which torrents reach the LSD endpoint.
#[derive(Clone)]
pub(crate) struct LsdHandle(CommandSender);

impl LsdHandle {
    pub fn announce(&self, info_hash: InfoHash) {
        let _ = self.0.send(Command::Announce(info_hash));
    }

    pub fn shutdown(&self) {
        let _ = self.0.send(Command::Shutdown);
    }
}

/// Spawns the LSD endpoint. `listen_port` is the TCP port other hosts
/// should connect back to, i.e. the peer listener's port.
pub(crate) fn spawn(
    registry: TorrentRegistry,
    listen_port: u16,
) -> io::Result<(LsdHandle, tokio::task::JoinHandle<()>)> {
    let socket = bind_multicast_v4()?;
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
    let mut lsd = Lsd {
        socket,
        registry,
        listen_port,
        cookie: format!("{:08x}", rand::thread_rng().gen::<u32>()),
        announced: HashSet::new(),
        cmd_port,
    };
    let join_handle = tokio::spawn(async move { lsd.run().await });
    Ok((LsdHandle(cmd_chan), join_handle))
}

/// Creates the multicast UDP socket: port 6771 with address reuse (other
/// BitTorrent clients on the same host share it), joined to the LSD group.
fn bind_multicast_v4() -> io::Result<UdpSocket> {
    use nix::sys::socket::{
        bind, setsockopt, socket, sockopt, AddressFamily, InetAddr, SockAddr,
        SockFlag, SockType,
    };

    let to_io = |e: nix::Error| match e.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, e),
    };

    let fd = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(to_io)?;
    setsockopt(fd, sockopt::ReuseAddr, &true).map_err(to_io)?;
    let bind_addr: SocketAddr =
        SocketAddr::from(([0, 0, 0, 0], MULTICAST_V4.port()));
    bind(fd, &SockAddr::new_inet(InetAddr::from_std(&bind_addr)))
        .map_err(to_io)?;

    // the fd is valid and owned from here on
    let socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };
    socket.join_multicast_v4(MULTICAST_V4.ip(), &Ipv4Addr::UNSPECIFIED)?;
    UdpSocket::from_std(socket)
}

/// One parsed BT-SEARCH announce.
#[derive(Debug, PartialEq)]
struct Announce {
    host: String,
    port: u16,
    info_hash: InfoHash,
    cookie: Option<String>,
}

struct Lsd {
    socket: UdpSocket,
    registry: TorrentRegistry,
    listen_port: u16,
    /// Our instance tag, echoed in every broadcast.
    cookie: String,
    /// The torrents being periodically re-announced.
    announced: HashSet<InfoHash>,
    cmd_port: CommandReceiver,
}

impl Lsd {
    async fn run(&mut self) {
        log::info!("LSD endpoint up on {}", MULTICAST_V4);
        let mut recv_buf = vec![0u8; 1400];
        let mut announce_interval = time::interval(ANNOUNCE_INTERVAL);
        loop {
            tokio::select! {
                Some(cmd) = self.cmd_port.recv() => match cmd {
                    Command::Announce(info_hash) => {
                        self.announced.insert(info_hash);
                        self.broadcast(&info_hash).await;
                    }
                    Command::Shutdown => {
                        log::info!("Shutting down LSD endpoint");
                        break;
                    }
                },
                received = self.socket.recv_from(&mut recv_buf) => {
                    match received {
                        Ok((len, from)) => {
                            self.handle_datagram(&recv_buf[..len], from);
                        }
                        Err(e) => {
                            log::warn!("LSD receive error: {}", e);
                        }
                    }
                }
                _ = announce_interval.tick() => {
                    self.reannounce().await;
                }
            }
        }
    }

    /// Re-broadcasts every torrent still registered in the engine and
    /// forgets the ones that are gone (stopped).
    async fn reannounce(&mut self) {
        let registered: Vec<InfoHash> = {
            let registry =
                self.registry.read().expect("torrent registry lock poisoned");
            self.announced
                .iter()
                .filter(|info_hash| registry.contains_key(*info_hash))
                .copied()
                .collect()
        };
        self.announced = registered.iter().copied().collect();
        for info_hash in registered {
            self.broadcast(&info_hash).await;
        }
    }

    async fn broadcast(&self, info_hash: &InfoHash) {
        let msg = build_announce(info_hash, self.listen_port, &self.cookie);
        log::debug!("LSD announcing {}", info_hash_hex(info_hash));
        if let Err(e) = self
            .socket
            .send_to(msg.as_bytes(), SocketAddr::V4(MULTICAST_V4))
            .await
        {
            log::warn!("LSD announce failed: {}", e);
        }
    }

    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let announce = match parse_announce(datagram) {
            Some(announce) => announce,
            None => {
                log::debug!("Malformed LSD datagram from {}", from);
                return;
            }
        };
        // our own announce echoed back by the multicast loop
        if announce.cookie.as_deref() == Some(self.cookie.as_str()) {
            log::trace!("Dropping our own LSD announce");
            return;
        }
        // the host header must name the group the receiving socket serves
        if announce.host != MULTICAST_V4.to_string() {
            log::debug!("LSD announce for wrong group: {}", announce.host);
            return;
        }
        if announce.port == 0 {
            return;
        }

        let entry = {
            let registry =
                self.registry.read().expect("torrent registry lock poisoned");
            registry.get(&announce.info_hash).cloned()
        };
        let entry = match entry {
            Some(entry) => entry,
            // not one of our torrents
            None => return,
        };
        // private torrents must not accept LSD discovered peers
        if entry.is_private {
            return;
        }

        let peer = PeerInfo::new(SocketAddr::new(from.ip(), announce.port));
        log::info!(
            "LSD discovered peer {} for {}",
            peer.addr,
            info_hash_hex(&announce.info_hash)
        );
        let _ = entry.handle.add_peer(peer);
    }
}

fn build_announce(info_hash: &InfoHash, port: u16, cookie: &str) -> String {
    format!(
        "BT-SEARCH * HTTP/1.1\r\n\
         Host: {}\r\n\
         Port: {}\r\n\
         Infohash: {}\r\n\
         cookie: {}\r\n\
         \r\n\r\n",
        MULTICAST_V4,
        port,
        info_hash_hex(info_hash).to_uppercase(),
        cookie
    )
}

/// Parses a BT-SEARCH datagram: the request line, then `\r\n` separated
/// headers, closed off by a double CRLF. Returns `None` on any violation.
fn parse_announce(datagram: &[u8]) -> Option<Announce> {
    let text = std::str::from_utf8(datagram).ok()?;
    if !text.ends_with("\r\n\r\n") {
        return None;
    }
    let mut lines = text.split("\r\n");
    if lines.next()? != "BT-SEARCH * HTTP/1.1" {
        return None;
    }

    let mut host = None;
    let mut port = None;
    let mut info_hash = None;
    let mut cookie = None;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = {
            let mut parts = line.splitn(2, ':');
            (parts.next()?.trim(), parts.next()?.trim())
        };
        match name.to_ascii_lowercase().as_str() {
            "host" => host = Some(value.to_string()),
            "port" => port = Some(value.parse::<u16>().ok()?),
            "infohash" => {
                // must be exactly 40 hex characters
                if value.len() != 40 {
                    return None;
                }
                let bytes = hex::decode(value).ok()?;
                let mut hash = [0u8; 20];
                hash.copy_from_slice(&bytes);
                info_hash = Some(hash);
            }
            "cookie" => cookie = Some(value.to_string()),
            _ => {}
        }
    }

    Some(Announce {
        host: host?,
        port: port?,
        info_hash: info_hash?,
        cookie,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_hash() -> InfoHash {
        let mut hash = [0u8; 20];
        for (index, byte) in hash.iter_mut().enumerate() {
            *byte = index as u8;
        }
        hash
    }

    #[test]
    fn test_announce_round_trip() {
        let msg = build_announce(&test_hash(), 6881, "cafe01");
        let parsed = parse_announce(msg.as_bytes()).unwrap();
        assert_eq!(parsed.host, "239.192.152.143:6771");
        assert_eq!(parsed.port, 6881);
        assert_eq!(parsed.info_hash, test_hash());
        assert_eq!(parsed.cookie.as_deref(), Some("cafe01"));
    }

    #[test]
    fn test_announce_hash_rendering_is_uppercase_hex() {
        let msg = build_announce(&test_hash(), 6881, "c");
        assert!(msg.contains("Infohash: 000102030405060708090A0B0C0D0E0F10111213\r\n"));
    }

    #[test]
    fn test_parse_rejects_malformed_datagrams() {
        // wrong request line
        assert!(parse_announce(b"GET * HTTP/1.1\r\nHost: x\r\n\r\n\r\n")
            .is_none());
        // missing terminating double CRLF
        let msg = build_announce(&test_hash(), 6881, "c");
        assert!(parse_announce(msg.trim_end().as_bytes()).is_none());
        // not utf8
        assert!(parse_announce(&[0xff, 0xfe, 0xfd]).is_none());
    }

    #[test]
    fn test_parse_rejects_bad_infohash() {
        // 39 hex characters
        let msg = "BT-SEARCH * HTTP/1.1\r\n\
                   Host: 239.192.152.143:6771\r\n\
                   Port: 6881\r\n\
                   Infohash: 000102030405060708090A0B0C0D0E0F1011121\r\n\
                   cookie: c\r\n\
                   \r\n\r\n";
        assert!(parse_announce(msg.as_bytes()).is_none());
        // non-hex characters
        let msg = "BT-SEARCH * HTTP/1.1\r\n\
                   Host: 239.192.152.143:6771\r\n\
                   Port: 6881\r\n\
                   Infohash: zz0102030405060708090A0B0C0D0E0F10111213\r\n\
                   \r\n\r\n";
        assert!(parse_announce(msg.as_bytes()).is_none());
    }

    // the self-rejection path: a parsed echo of our own announce carries
    // our cookie and must be dropped before any torrent lookup
    #[test]
    fn test_own_cookie_is_recognized() {
        let cookie = "feedbeef";
        let msg = build_announce(&test_hash(), 6881, cookie);
        let parsed = parse_announce(msg.as_bytes()).unwrap();
        assert_eq!(parsed.cookie.as_deref(), Some(cookie));
    }

    #[test]
    fn test_headers_parse_case_insensitively() {
        let msg = "BT-SEARCH * HTTP/1.1\r\n\
                   host: 239.192.152.143:6771\r\n\
                   PORT: 6881\r\n\
                   InfoHash: 000102030405060708090A0B0C0D0E0F10111213\r\n\
                   \r\n\r\n";
        let parsed = parse_announce(msg.as_bytes()).unwrap();
        assert_eq!(parsed.port, 6881);
        assert!(parsed.cookie.is_none());
    }
}
