//! The inbound peer listener.
//!
//! Accepted sockets sit in a pending state until their handshake arrives;
//! a per-connection watchdog drops the ones that never speak. Once the
//! handshake is in, the info hash routes the connection to its torrent,
//! which adopts it (or replaces the peer's previous connection). The bytes
//! the remote may have sent after its handshake travel along in the read
//! buffer.

use std::{net::SocketAddr, time::Duration};

use futures::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    time,
};
use tokio_util::codec::Framed;

use crate::{
    alert::{Alert, AlertSender},
    engine::TorrentRegistry,
    peer::codec::HandshakeCodec,
};

/// Binds the listener and returns its actual port (relevant when the
/// configured port was 0) along with the accept task.
pub(crate) async fn spawn(
    port: u16,
    handshake_timeout: Duration,
    registry: TorrentRegistry,
    alert_chan: AlertSender,
) -> std::io::Result<(u16, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let port = listener.local_addr()?.port();
    log::info!("Peer listener accepting on port {}", port);
    let _ = alert_chan.send(Alert::ListenerStarted { port });

    let join_handle = tokio::spawn(async move {
        accept_loop(listener, handshake_timeout, registry).await;
    });
    Ok((port, join_handle))
}

async fn accept_loop(
    listener: TcpListener,
    handshake_timeout: Duration,
    registry: TorrentRegistry,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                log::info!("Accepted connection from {}", addr);
                let registry = registry.clone();
                tokio::spawn(async move {
                    handle_pending(stream, addr, handshake_timeout, registry)
                        .await;
                });
            }
            Err(e) => {
                // transient accept failures (e.g. fd pressure) shouldn't
                // kill the listener
                log::warn!("Accept error: {}", e);
            }
        }
    }
}

/// Drives one pending connection: waits for the remote's handshake under
/// the watchdog timeout, then hands the socket to the matching torrent.
/// Every failure path simply drops the socket.
async fn handle_pending(
    stream: TcpStream,
    addr: SocketAddr,
    handshake_timeout: Duration,
    registry: TorrentRegistry,
) {
    let mut socket = Framed::new(stream, HandshakeCodec);

    let handshake =
        match time::timeout(handshake_timeout, socket.next()).await {
            Err(_) => {
                log::info!("Pending peer {} never handshaked", addr);
                return;
            }
            Ok(None) => {
                log::info!("Pending peer {} closed the connection", addr);
                return;
            }
            Ok(Some(Err(e))) => {
                log::warn!("Pending peer {} handshake error: {}", addr, e);
                return;
            }
            Ok(Some(Ok(handshake))) => handshake,
        };

    // an inbound handshake is adopted by whichever running torrent serves
    // its info hash
    let entry = {
        let torrents =
            registry.read().expect("torrent registry lock poisoned");
        torrents.get(&handshake.info_hash).cloned()
    };
    let entry = match entry {
        Some(entry) => entry,
        None => {
            log::info!(
                "Peer {} handshaked unknown info hash, closing",
                addr
            );
            return;
        }
    };

    // hand the socket over with whatever the remote sent after its
    // handshake still buffered
    let parts = socket.into_parts();
    if let Err(e) = entry.handle.inbound_peer(
        addr,
        parts.io,
        parts.read_buf,
        handshake,
    ) {
        log::warn!("Torrent refused inbound peer {}: {}", addr, e);
    }
}
