//! The peer session: one task per connection, owning the socket and the
//! per-connection protocol state.
//!
//! The session speaks the wire protocol (handshake, choke/interest, block
//! exchange) and reports semantic events to its torrent; the torrent owns
//! the piece and request bookkeeping and drives the session through
//! commands. Because a session is a single task writing through a single
//! sink, at most one send is ever in flight per connection.

pub(crate) mod codec;

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    bitfield,
    conf::PeerConf,
    error::{ConnectionFailedReason, PeerError, PeerResult},
    torrent::TorrentContext,
    Bitfield, BlockInfo, PeerId, PieceIndex, BLOCK_LEN,
};
use codec::*;

/// The channel on which the torrent drives a peer session.
pub(crate) type CommandSender = UnboundedSender<SessionCommand>;
type CommandReceiver = UnboundedReceiver<SessionCommand>;

/// The channel on which sessions report to their torrent.
pub(crate) type EventSender = UnboundedSender<PeerEvent>;

type MessageSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

/// What a torrent may ask of a session.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Request a block from the peer and start expecting its bytes.
    SendRequest(BlockInfo),
    /// Tell the peer we no longer want the block and stop expecting it.
    CancelRequest(BlockInfo),
    /// Serve a block the peer asked for.
    SendBlock { block: BlockInfo, data: Vec<u8> },
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// A piece verified: update our availability and tell the peer unless it
    /// already claims the piece.
    AnnouncePiece(PieceIndex),
    Shutdown,
}

/// A semantic event a session reports to its torrent.
#[derive(Debug)]
pub(crate) struct PeerEvent {
    pub addr: SocketAddr,
    pub kind: PeerEventKind,
}

#[derive(Debug)]
pub(crate) enum PeerEventKind {
    /// The TCP connection is established (outbound only; inbound sessions
    /// are born connected).
    Connected,
    /// An outbound TCP connect failed.
    ConnectFailed(ConnectionFailedReason),
    /// The handshake completed and the remote identified itself.
    Handshaked { peer_id: PeerId },
    /// The remote's full piece availability arrived.
    BitfieldReceived(Bitfield),
    /// The remote announced one new piece.
    HaveReceived(PieceIndex),
    ChokedUs,
    UnchokedUs,
    PeerInterested(bool),
    /// A block we requested arrived.
    BlockReceived { block: BlockInfo, data: Vec<u8> },
    /// The remote requested a block; already validated by the session.
    BlockRequested(BlockInfo),
    /// The remote cancelled one of its requests.
    CancelReceived(BlockInfo),
    /// The session ended. `was_self` is set when the handshake revealed we
    /// connected to ourselves.
    Disconnected { was_self: bool },
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// Used to verify that the bitfield exchange occurs right after the
    /// handshake and not later: entered once the handshakes are exchanged
    /// and left as soon as the first message arrives. Any later bitfield
    /// message is rejected and the connection dropped, as per the standard.
    AvailabilityExchange,
    /// The normal state of a session, in which any message apart from the
    /// handshake and the bitfield may be exchanged.
    Connected,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// The choke and interest state of a session.
///
/// Both sides of a new connection start off choked and not interested.
#[derive(Clone, Copy, Debug)]
struct Status {
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces we have.
    is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
        }
    }
}

pub(crate) struct PeerSession {
    /// Shared information of the torrent.
    torrent: Arc<TorrentContext>,
    conf: PeerConf,
    /// The port on which the session receives commands from its torrent.
    cmd_port: CommandReceiver,
    /// The channel on which the session reports to its torrent.
    events: EventSender,
    /// The remote address of the peer.
    addr: SocketAddr,
    status: Status,
    /// Our piece availability as last known to this session; the snapshot
    /// taken at spawn plus every announced piece since.
    own_pieces: Bitfield,
    /// The remote's piece availability. Allocated once at the right length;
    /// a received bitfield is blitted into it.
    peer_pieces: Bitfield,
    /// The blocks we requested from this peer and whose bytes we expect.
    /// A received block not in this set is dropped.
    outgoing_requests: HashSet<BlockInfo>,
    /// The remote's id, learned from its handshake.
    peer_id: Option<PeerId>,
    /// Set when the handshake revealed that we connected to ourselves.
    was_self: bool,
    /// How many requests the peer sent while we were choking it. Such
    /// requests are dropped with a warning rather than closing the
    /// connection.
    choked_request_count: usize,
    is_handshake_sent: bool,
    is_handshake_received: bool,
    is_bitfield_sent: bool,
    last_received_time: Instant,
    last_sent_time: Instant,
}

impl PeerSession {
    /// Creates a session that will connect out to `addr`, along with the
    /// command channel the torrent drives it with.
    pub fn outbound(
        torrent: Arc<TorrentContext>,
        conf: PeerConf,
        events: EventSender,
        own_pieces: Bitfield,
        addr: SocketAddr,
    ) -> (Self, CommandSender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (Self::new(torrent, conf, events, own_pieces, addr, cmd_port), cmd_chan)
    }

    /// Creates a session for an accepted connection whose handshake the
    /// listener already read and the torrent already validated.
    pub fn inbound(
        torrent: Arc<TorrentContext>,
        conf: PeerConf,
        events: EventSender,
        own_pieces: Bitfield,
        addr: SocketAddr,
        peer_id: PeerId,
    ) -> (Self, CommandSender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let mut session =
            Self::new(torrent, conf, events, own_pieces, addr, cmd_port);
        session.peer_id = Some(peer_id);
        session.is_handshake_received = true;
        (session, cmd_chan)
    }

    fn new(
        torrent: Arc<TorrentContext>,
        conf: PeerConf,
        events: EventSender,
        own_pieces: Bitfield,
        addr: SocketAddr,
        cmd_port: CommandReceiver,
    ) -> Self {
        let piece_count = torrent.storage.piece_count;
        Self {
            torrent,
            conf,
            cmd_port,
            events,
            addr,
            status: Status::default(),
            own_pieces,
            peer_pieces: Bitfield::repeat(false, piece_count),
            outgoing_requests: HashSet::new(),
            peer_id: None,
            was_self: false,
            choked_request_count: 0,
            is_handshake_sent: false,
            is_handshake_received: false,
            is_bitfield_sent: false,
            last_received_time: Instant::now(),
            last_sent_time: Instant::now(),
        }
    }

    /// Runs an outbound session to completion: connect, handshake, then the
    /// message loop. Always reports the session's end to the torrent.
    pub async fn start_outbound(&mut self) {
        log::info!(
            "Torrent {} starting outbound peer {} session",
            self.torrent.id,
            self.addr
        );
        let result = self.run_outbound().await;
        self.shut_down(result);
    }

    /// Runs an accepted session to completion: respond to the already
    /// received handshake, then the message loop.
    pub async fn start_inbound(
        &mut self,
        stream: TcpStream,
        read_buf: BytesMut,
    ) {
        log::info!(
            "Torrent {} starting inbound peer {} session",
            self.torrent.id,
            self.addr
        );
        let result = self.run_inbound(stream, read_buf).await;
        self.shut_down(result);
    }

    fn shut_down(&mut self, result: PeerResult<()>) {
        match result {
            Ok(()) | Err(PeerError::Shutdown) => {
                log::info!("Peer {} session stopped", self.addr)
            }
            Err(e) => log::warn!("Peer {} session error: {}", self.addr, e),
        }
        if self.status.state != State::Disconnected {
            self.status.state = State::Disconnected;
            self.emit(PeerEventKind::Disconnected {
                was_self: self.was_self,
            });
        }
    }

    async fn run_outbound(&mut self) -> PeerResult<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let socket = match time::timeout(
            self.conf.handshake_timeout,
            TcpStream::connect(self.addr),
        )
        .await
        {
            Err(_) => {
                log::info!("Connecting to peer {} timed out", self.addr);
                self.status.state = State::Disconnected;
                self.emit(PeerEventKind::ConnectFailed(
                    ConnectionFailedReason::TimedOut,
                ));
                return Ok(());
            }
            Ok(Err(e)) => {
                log::info!("Connecting to peer {} failed: {}", self.addr, e);
                self.status.state = State::Disconnected;
                self.emit(PeerEventKind::ConnectFailed(
                    ConnectionFailedReason::from(&e),
                ));
                return Ok(());
            }
            Ok(Ok(socket)) => socket,
        };
        log::info!("Connected to peer {}", self.addr);
        self.emit(PeerEventKind::Connected);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.status.state = State::Handshaking;
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        log::info!("Sending handshake to peer {}", self.addr);
        self.is_handshake_sent = true;
        socket.send(handshake).await?;
        self.last_sent_time = Instant::now();

        // receive the peer's handshake within the handshake timeout
        log::info!("Waiting for peer {} handshake", self.addr);
        let peer_handshake = match time::timeout(
            self.conf.handshake_timeout,
            socket.next(),
        )
        .await
        {
            Err(_) | Ok(None) => return Err(PeerError::Timeout),
            Ok(Some(handshake)) => handshake?,
        };
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
        // the codec only returns a handshake whose protocol string is valid
        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != self.torrent.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(PeerError::InvalidInfoHash);
        }
        self.check_not_self(&peer_handshake.peer_id)?;
        self.on_handshaked(peer_handshake.peer_id);

        // now that we have the handshake we switch to the message codec.
        // Note that we need to keep the read buffer of the original codec as
        // it may contain bytes of messages the peer sent right after its
        // handshake.
        let socket = switch_codec(socket);
        self.run(socket).await
    }

    async fn run_inbound(
        &mut self,
        stream: TcpStream,
        read_buf: BytesMut,
    ) -> PeerResult<()> {
        self.status.state = State::Handshaking;
        // the remote's handshake was already received and validated; we only
        // owe it ours. The leftover bytes the listener read past the
        // handshake stay at the head of the read buffer.
        let mut parts = FramedParts::new(stream, HandshakeCodec);
        parts.read_buf = read_buf;
        let mut socket = Framed::from_parts(parts);

        log::info!("Sending handshake to peer {}", self.addr);
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        self.is_handshake_sent = true;
        socket.send(handshake).await?;
        self.last_sent_time = Instant::now();

        // `inbound` set the peer id and the handshake-received flag
        debug_assert!(self.is_handshake_received);
        self.emit(PeerEventKind::Handshaked {
            peer_id: self.peer_id.expect("inbound session without peer id"),
        });

        let socket = switch_codec(socket);
        self.run(socket).await
    }

    fn check_not_self(&mut self, peer_id: &PeerId) -> PeerResult<()> {
        if *peer_id == self.torrent.client_id {
            log::info!("Peer {} is ourselves", self.addr);
            self.was_self = true;
            return Err(PeerError::SelfConnection);
        }
        Ok(())
    }

    fn on_handshaked(&mut self, peer_id: PeerId) {
        log::info!("Received handshake from peer {}", self.addr);
        if let Some(client) = client_from_peer_id(&peer_id) {
            log::info!("Peer {} client: {}", self.addr, client);
        }
        self.peer_id = Some(peer_id);
        self.is_handshake_received = true;
        self.emit(PeerEventKind::Handshaked { peer_id });
    }

    /// Runs the session after the handshake: sends our bitfield, then
    /// exchanges messages until the connection closes or an error occurs.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> PeerResult<()> {
        // split the sink and stream so that we can pass the sink to message
        // handlers while polling the stream in the loop
        let (mut sink, mut stream) = socket.split();

        // the bitfield, if sent at all, must precede every other message
        debug_assert!(self.is_handshake_sent && self.is_handshake_received);
        if !self.is_bitfield_sent {
            let payload = if self.torrent.mask_bitfield {
                vec![0; bitfield::wire_len(self.own_pieces.len())]
            } else {
                bitfield::to_wire(&self.own_pieces)
            };
            log::info!("Sending bitfield to peer {}", self.addr);
            self.is_bitfield_sent = true;
            self.send_msg(&mut sink, Message::Bitfield(payload)).await?;
        }

        self.status.state = State::AvailabilityExchange;
        log::info!(
            "Peer {} session state: {:?}",
            self.addr,
            self.status.state
        );

        let mut tick = time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                maybe_msg = stream.next() => {
                    match maybe_msg {
                        Some(msg) => {
                            self.handle_msg(&mut sink, msg?).await?;
                        }
                        // the remote closed the connection
                        None => return Ok(()),
                    }
                }
                Some(cmd) = self.cmd_port.recv() => {
                    self.handle_cmd(&mut sink, cmd).await?;
                }
                _ = tick.tick() => {
                    self.tick(&mut sink).await?;
                }
            }
        }
    }

    /// The once a second housekeeping: inactivity timeout and keep-alives.
    async fn tick(&mut self, sink: &mut MessageSink) -> PeerResult<()> {
        if self.last_received_time.elapsed() >= self.conf.inactive_timeout {
            log::warn!("Peer {} inactive, disconnecting", self.addr);
            return Err(PeerError::Timeout);
        }
        if self.last_sent_time.elapsed() >= self.conf.keep_alive_interval {
            log::debug!("Sending keep alive to peer {}", self.addr);
            self.send_msg(sink, Message::KeepAlive).await?;
        }
        Ok(())
    }

    async fn send_msg(
        &mut self,
        sink: &mut MessageSink,
        msg: Message,
    ) -> PeerResult<()> {
        log::debug!("Sending message {:?} to peer {}", msg.id(), self.addr);
        sink.send(msg).await?;
        self.last_sent_time = Instant::now();
        Ok(())
    }

    async fn handle_cmd(
        &mut self,
        sink: &mut MessageSink,
        cmd: SessionCommand,
    ) -> PeerResult<()> {
        match cmd {
            SessionCommand::SendRequest(block) => {
                self.outgoing_requests.insert(block);
                self.send_msg(sink, Message::Request(block)).await?;
            }
            SessionCommand::CancelRequest(block) => {
                self.outgoing_requests.remove(&block);
                self.send_msg(sink, Message::Cancel(block)).await?;
            }
            SessionCommand::SendBlock { block, data } => {
                debug_assert_eq!(block.len as usize, data.len());
                self.send_msg(
                    sink,
                    Message::Block {
                        piece_index: block.piece_index,
                        offset: block.offset,
                        data,
                    },
                )
                .await?;
            }
            SessionCommand::Choke => {
                if !self.status.is_peer_choked {
                    self.status.is_peer_choked = true;
                    self.send_msg(sink, Message::Choke).await?;
                }
            }
            SessionCommand::Unchoke => {
                if self.status.is_peer_choked {
                    self.status.is_peer_choked = false;
                    self.send_msg(sink, Message::Unchoke).await?;
                }
            }
            SessionCommand::Interested => {
                if !self.status.is_interested {
                    self.status.is_interested = true;
                    log::info!("Interested in peer {}", self.addr);
                    self.send_msg(sink, Message::Interested).await?;
                }
            }
            SessionCommand::NotInterested => {
                if self.status.is_interested {
                    self.status.is_interested = false;
                    log::info!("No longer interested in peer {}", self.addr);
                    self.send_msg(sink, Message::NotInterested).await?;
                }
            }
            SessionCommand::AnnouncePiece(piece_index) => {
                self.own_pieces.set(piece_index, true);
                // no point announcing to a peer that already has the piece
                if !self.peer_pieces[piece_index] {
                    self.send_msg(sink, Message::Have { piece_index })
                        .await?;
                }
            }
            SessionCommand::Shutdown => {
                log::info!("Shutting down peer {} session", self.addr);
                return Err(PeerError::Shutdown);
            }
        }
        Ok(())
    }

    async fn handle_msg(
        &mut self,
        sink: &mut MessageSink,
        msg: Message,
    ) -> PeerResult<()> {
        log::debug!(
            "Received message {:?} from peer {}",
            msg.id(),
            self.addr
        );
        self.last_received_time = Instant::now();

        // the bitfield message may only be received directly after the
        // handshake
        let msg = if self.status.state == State::AvailabilityExchange {
            self.status.state = State::Connected;
            log::info!(
                "Peer {} session state: {:?}",
                self.addr,
                self.status.state
            );
            match msg {
                Message::Bitfield(payload) => {
                    return self.handle_bitfield_msg(payload);
                }
                msg => msg,
            }
        } else {
            msg
        };

        match msg {
            Message::Bitfield(_) => {
                log::warn!(
                    "Peer {} sent bitfield not as its first message",
                    self.addr
                );
                return Err(PeerError::BitfieldNotFirst);
            }
            Message::KeepAlive => {
                log::debug!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    // we no longer expect our pending requests to be served;
                    // the torrent cancels them and tells the peer
                    self.outgoing_requests.clear();
                    self.emit(PeerEventKind::ChokedUs);
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.emit(PeerEventKind::UnchokedUs);
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                    self.emit(PeerEventKind::PeerInterested(true));
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                    self.emit(PeerEventKind::PeerInterested(false));
                }
            }
            Message::Have { piece_index } => {
                self.handle_have_msg(piece_index)?;
            }
            Message::Request(block) => {
                self.handle_request_msg(block)?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block_msg(piece_index, offset, data);
            }
            Message::Cancel(block) => {
                self.handle_cancel_msg(block)?;
            }
            Message::Port { port } => {
                // DHT is not supported; noted for diagnostics only
                log::debug!("Peer {} DHT port: {}", self.addr, port);
            }
        }

        Ok(())
    }

    fn handle_bitfield_msg(&mut self, payload: Vec<u8>) -> PeerResult<()> {
        log::info!("Handling peer {} bitfield message", self.addr);
        let incoming =
            bitfield::from_wire(payload, self.torrent.storage.piece_count)
                .ok_or(PeerError::InvalidMessage("bitfield"))?;
        // the session-owned bitfield is stable; incoming bits are blitted in
        bitfield::copy_from(&mut self.peer_pieces, &incoming);
        log::info!(
            "Peer {} has {}/{} pieces",
            self.addr,
            self.peer_pieces.count_ones(),
            self.peer_pieces.len()
        );
        self.emit(PeerEventKind::BitfieldReceived(self.peer_pieces.clone()));
        Ok(())
    }

    fn handle_have_msg(&mut self, piece_index: PieceIndex) -> PeerResult<()> {
        // validated against the piece count
        if piece_index >= self.torrent.storage.piece_count {
            log::warn!(
                "Peer {} sent have with invalid piece {}",
                self.addr,
                piece_index
            );
            return Err(PeerError::InvalidMessage("have piece index"));
        }
        if !self.peer_pieces[piece_index] {
            self.peer_pieces.set(piece_index, true);
            self.emit(PeerEventKind::HaveReceived(piece_index));
        }
        Ok(())
    }

    fn handle_request_msg(&mut self, block: BlockInfo) -> PeerResult<()> {
        log::debug!("Peer {} requested {:?}", self.addr, block);

        // a request while choked is dropped with a warning, not a
        // disconnect: the peer may not have processed our choke yet
        if self.status.is_peer_choked {
            self.choked_request_count += 1;
            log::warn!(
                "Peer {} requested {:?} while choked ({} so far)",
                self.addr,
                block,
                self.choked_request_count
            );
            return Ok(());
        }

        let piece_len = self
            .torrent
            .storage
            .piece_len(block.piece_index)
            .map_err(|_| PeerError::InvalidMessage("request piece index"))?;
        if block.len == 0 || block.len > BLOCK_LEN {
            return Err(PeerError::InvalidMessage("request length"));
        }
        if block.offset % BLOCK_LEN != 0 {
            return Err(PeerError::InvalidMessage("request offset alignment"));
        }
        if block.offset + block.len > piece_len {
            return Err(PeerError::InvalidMessage("request bounds"));
        }
        // we can only serve pieces we have verified
        if !self.own_pieces[block.piece_index] {
            return Err(PeerError::InvalidMessage("request for missing piece"));
        }

        self.emit(PeerEventKind::BlockRequested(block));
        Ok(())
    }

    fn handle_block_msg(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) {
        let block = BlockInfo {
            piece_index,
            offset,
            len: data.len() as u32,
        };
        // Only accept blocks we are currently expecting from this peer; the
        // request was made with canonical block geometry, so a match also
        // guarantees the offset and length are right. Unsolicited blocks
        // are dropped without closing the connection.
        if !self.outgoing_requests.remove(&block) {
            log::warn!(
                "Peer {} sent block we didn't request: {:?}",
                self.addr,
                block
            );
            return;
        }
        log::debug!("Received block {:?} from peer {}", block, self.addr);
        self.emit(PeerEventKind::BlockReceived { block, data });
    }

    fn handle_cancel_msg(&mut self, block: BlockInfo) -> PeerResult<()> {
        // a cancel must match a prior request's parameters, so it is only
        // bounds checked loosely here; an unmatched cancel is a noop in the
        // torrent's incoming queue
        if block.piece_index >= self.torrent.storage.piece_count {
            return Err(PeerError::InvalidMessage("cancel piece index"));
        }
        self.emit(PeerEventKind::CancelReceived(block));
        Ok(())
    }

    fn emit(&self, kind: PeerEventKind) {
        // the torrent outliving its sessions is the normal shutdown order,
        // so a closed event channel is not an error
        let _ = self.events.send(PeerEvent {
            addr: self.addr,
            kind,
        });
    }
}

/// Switches a handshake framed socket to the message codec, carrying over
/// both buffers.
fn switch_codec(
    socket: Framed<TcpStream, HandshakeCodec>,
) -> Framed<TcpStream, PeerCodec> {
    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    // reuse buffers of previous codec
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    Framed::from_parts(new_parts)
}

/// Decodes an Azureus style peer id ("-AB1234-...") into a client tag, e.g.
/// "AB 1.2.3.4", for diagnostics.
fn client_from_peer_id(peer_id: &PeerId) -> Option<String> {
    if peer_id[0] != b'-' || peer_id[7] != b'-' {
        return None;
    }
    let code = &peer_id[1..3];
    let version = &peer_id[3..7];
    if !code.iter().all(u8::is_ascii_alphabetic)
        || !version.iter().all(u8::is_ascii_digit)
    {
        return None;
    }
    let code = std::str::from_utf8(code).ok()?;
    let version = version
        .iter()
        .map(|digit| (digit - b'0').to_string())
        .collect::<Vec<_>>()
        .join(".");
    Some(format!("{} {}", code, version))
}
