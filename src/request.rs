//! The request pipelines: blocks we asked peers for and blocks peers asked
//! us for.
//!
//! The outgoing registry doubles as the pending queue: requests are drained
//! for sending in registration order, subject to the rate limiters.
//! Cancellation marks the record rather than removing it, so a cancel racing
//! a send can never be lost; cancelled records are swept at the end of the
//! scheduling pass.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    time::{Duration, Instant},
};

use crate::{BlockInfo, PieceIndex};

/// Identifies an outgoing request: a peer is asked for a given block of a
/// given piece at most once concurrently.
pub(crate) type OutgoingKey = (SocketAddr, PieceIndex, usize);

/// A block request we made (or queued to make) to a peer.
#[derive(Clone, Debug)]
pub(crate) struct OutgoingRequest {
    pub block: BlockInfo,
    pub peer: SocketAddr,
    pub request_time: Instant,
    pub has_been_sent: bool,
    pub is_cancelled: bool,
}

impl OutgoingRequest {
    pub fn key(&self) -> OutgoingKey {
        (self.peer, self.block.piece_index, self.block.index_in_piece())
    }
}

/// The outcome of cancelling an outgoing request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CancelOutcome {
    /// No live record with that key: nothing to do (and no second wire
    /// cancel for an already cancelled request).
    Noop,
    /// The request was still queued locally; nothing went over the wire.
    CancelledLocally,
    /// The request was already sent, so the peer must be told.
    CancelledOnWire,
}

#[derive(Default)]
pub(crate) struct OutgoingRequests {
    requests: Vec<OutgoingRequest>,
}

impl OutgoingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new request, refusing duplicates of a live record.
    pub fn register(
        &mut self,
        block: BlockInfo,
        peer: SocketAddr,
        now: Instant,
    ) -> bool {
        let key = (peer, block.piece_index, block.index_in_piece());
        if self.find(key).is_some() {
            return false;
        }
        self.requests.push(OutgoingRequest {
            block,
            peer,
            request_time: now,
            has_been_sent: false,
            is_cancelled: false,
        });
        true
    }

    fn find(&self, key: OutgoingKey) -> Option<usize> {
        self.requests
            .iter()
            .position(|request| !request.is_cancelled && request.key() == key)
    }

    /// The next queued request that hasn't been sent or cancelled.
    pub fn next_unsent(&self) -> Option<OutgoingRequest> {
        self.requests
            .iter()
            .find(|request| !request.has_been_sent && !request.is_cancelled)
            .cloned()
    }

    pub fn mark_sent(&mut self, key: OutgoingKey) {
        if let Some(index) = self.find(key) {
            self.requests[index].has_been_sent = true;
        }
    }

    /// Removes and returns the record, typically on receipt of its block.
    pub fn complete(&mut self, key: OutgoingKey) -> Option<OutgoingRequest> {
        let index = self.find(key)?;
        Some(self.requests.remove(index))
    }

    /// Cancels the request with the given key. Idempotent: a second cancel
    /// is a noop and in particular never produces a second wire cancel.
    pub fn cancel(&mut self, key: OutgoingKey) -> CancelOutcome {
        match self.find(key) {
            None => CancelOutcome::Noop,
            Some(index) => {
                let request = &mut self.requests[index];
                request.is_cancelled = true;
                if request.has_been_sent {
                    CancelOutcome::CancelledOnWire
                } else {
                    CancelOutcome::CancelledLocally
                }
            }
        }
    }

    /// Cancels every live request to the peer, returning the cancelled
    /// records (the caller emits wire cancels for the sent ones).
    pub fn cancel_for_peer(
        &mut self,
        peer: &SocketAddr,
    ) -> Vec<OutgoingRequest> {
        let mut cancelled = Vec::new();
        for request in &mut self.requests {
            if !request.is_cancelled && request.peer == *peer {
                request.is_cancelled = true;
                cancelled.push(request.clone());
            }
        }
        cancelled
    }

    /// Cancels live requests for the same block at other peers (endgame:
    /// the first arrived copy wins).
    pub fn cancel_duplicates(
        &mut self,
        block: &BlockInfo,
        winner: &SocketAddr,
    ) -> Vec<OutgoingRequest> {
        let block_index = block.index_in_piece();
        let mut cancelled = Vec::new();
        for request in &mut self.requests {
            if !request.is_cancelled
                && request.peer != *winner
                && request.block.piece_index == block.piece_index
                && request.block.index_in_piece() == block_index
            {
                request.is_cancelled = true;
                cancelled.push(request.clone());
            }
        }
        cancelled
    }

    /// Cancels live requests older than the timeout, returning them.
    pub fn cancel_expired(
        &mut self,
        timeout: Duration,
        now: Instant,
    ) -> Vec<OutgoingRequest> {
        let mut cancelled = Vec::new();
        for request in &mut self.requests {
            if !request.is_cancelled
                && now.duration_since(request.request_time) >= timeout
            {
                request.is_cancelled = true;
                cancelled.push(request.clone());
            }
        }
        cancelled
    }

    /// Drops every record bound to the peer, cancelled or not. Done on
    /// disconnect, where there is no one left to notify.
    pub fn remove_for_peer(&mut self, peer: &SocketAddr) {
        self.requests.retain(|request| request.peer != *peer);
    }

    /// Sweeps out cancelled records. Run after a scheduling pass has emitted
    /// the wire cancels.
    pub fn sweep_cancelled(&mut self) {
        self.requests.retain(|request| !request.is_cancelled);
    }

    /// The number of live requests bound to the peer, counted against its
    /// pipeline quota.
    pub fn count_for_peer(&self, peer: &SocketAddr) -> usize {
        self.requests
            .iter()
            .filter(|request| {
                !request.is_cancelled && request.peer == *peer
            })
            .count()
    }

    /// The number of live records overall.
    pub fn len(&self) -> usize {
        self.requests
            .iter()
            .filter(|request| !request.is_cancelled)
            .count()
    }
}

/// A block request a peer made to us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct IncomingRequest {
    pub peer: SocketAddr,
    pub piece_index: PieceIndex,
    pub offset: u32,
    pub len: u32,
    pub is_cancelled: bool,
}

impl IncomingRequest {
    /// An incoming request is identified by all four request parameters, as
    /// a cancel must match the request it cancels exactly.
    fn matches(
        &self,
        peer: &SocketAddr,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> bool {
        self.peer == *peer
            && self.piece_index == piece_index
            && self.offset == offset
            && self.len == len
    }
}

#[derive(Default)]
pub(crate) struct IncomingRequests {
    queue: VecDeque<IncomingRequest>,
}

impl IncomingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a request, refusing exact duplicates of a live record.
    pub fn push(
        &mut self,
        peer: SocketAddr,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> bool {
        let duplicate = self.queue.iter().any(|request| {
            !request.is_cancelled
                && request.matches(&peer, piece_index, offset, len)
        });
        if duplicate {
            return false;
        }
        self.queue.push_back(IncomingRequest {
            peer,
            piece_index,
            offset,
            len,
            is_cancelled: false,
        });
        true
    }

    /// Marks the matching queued request cancelled, so the upload loop skips
    /// it when it gets there.
    pub fn cancel(
        &mut self,
        peer: &SocketAddr,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) {
        if let Some(request) = self.queue.iter_mut().find(|request| {
            !request.is_cancelled
                && request.matches(peer, piece_index, offset, len)
        }) {
            request.is_cancelled = true;
        }
    }

    /// Returns a popped request to the head of the queue, e.g. when the
    /// upload rate limiter refused it this round.
    pub fn push_front(&mut self, request: IncomingRequest) {
        self.queue.push_front(request);
    }

    /// Pops the oldest live request, discarding cancelled ones on the way.
    pub fn pop(&mut self) -> Option<IncomingRequest> {
        while let Some(request) = self.queue.pop_front() {
            if !request.is_cancelled {
                return Some(request);
            }
        }
        None
    }

    /// Drops all requests from the peer, done on disconnect.
    pub fn remove_for_peer(&mut self, peer: &SocketAddr) {
        self.queue.retain(|request| request.peer != *peer);
    }

    pub fn len(&self) -> usize {
        self.queue
            .iter()
            .filter(|request| !request.is_cancelled)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;

    fn peer(port: u16) -> SocketAddr {
        ([10, 0, 0, 1], port).into()
    }

    fn block(piece_index: PieceIndex, index: usize) -> BlockInfo {
        BlockInfo {
            piece_index,
            offset: index as u32 * BLOCK_LEN,
            len: BLOCK_LEN,
        }
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut requests = OutgoingRequests::new();
        let now = Instant::now();
        assert!(requests.register(block(0, 0), peer(1), now));
        assert!(!requests.register(block(0, 0), peer(1), now));
        // same block to a different peer is fine (endgame)
        assert!(requests.register(block(0, 0), peer(2), now));
        assert_eq!(requests.len(), 2);
        assert_eq!(requests.count_for_peer(&peer(1)), 1);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut requests = OutgoingRequests::new();
        let now = Instant::now();
        requests.register(block(0, 0), peer(1), now);
        let key = (peer(1), 0, 0);
        requests.mark_sent(key);

        // the first cancel of a sent request produces a wire cancel
        assert_eq!(requests.cancel(key), CancelOutcome::CancelledOnWire);
        // the second does not
        assert_eq!(requests.cancel(key), CancelOutcome::Noop);

        requests.sweep_cancelled();
        assert_eq!(requests.len(), 0);
        assert_eq!(requests.cancel(key), CancelOutcome::Noop);
    }

    #[test]
    fn test_cancel_unsent_is_local() {
        let mut requests = OutgoingRequests::new();
        requests.register(block(0, 0), peer(1), Instant::now());
        assert_eq!(
            requests.cancel((peer(1), 0, 0)),
            CancelOutcome::CancelledLocally
        );
        // a cancelled record is no longer drained
        assert!(requests.next_unsent().is_none());
    }

    #[test]
    fn test_drain_order_and_sent_tracking() {
        let mut requests = OutgoingRequests::new();
        let now = Instant::now();
        requests.register(block(0, 0), peer(1), now);
        requests.register(block(0, 1), peer(1), now);

        let first = requests.next_unsent().unwrap();
        assert_eq!(first.block, block(0, 0));
        requests.mark_sent(first.key());

        let second = requests.next_unsent().unwrap();
        assert_eq!(second.block, block(0, 1));
        requests.mark_sent(second.key());
        assert!(requests.next_unsent().is_none());
    }

    #[test]
    fn test_cancel_for_peer() {
        let mut requests = OutgoingRequests::new();
        let now = Instant::now();
        for index in 0..5 {
            requests.register(block(0, index), peer(1), now);
            requests.mark_sent((peer(1), 0, index));
        }
        requests.register(block(0, 5), peer(2), now);

        let cancelled = requests.cancel_for_peer(&peer(1));
        assert_eq!(cancelled.len(), 5);
        assert!(cancelled.iter().all(|request| request.has_been_sent));
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn test_cancel_duplicates_spares_winner() {
        let mut requests = OutgoingRequests::new();
        let now = Instant::now();
        let target = block(3, 1);
        requests.register(target, peer(1), now);
        requests.register(target, peer(2), now);
        requests.register(target, peer(3), now);
        requests.mark_sent((peer(2), 3, 1));

        let cancelled = requests.cancel_duplicates(&target, &peer(1));
        assert_eq!(cancelled.len(), 2);
        assert!(cancelled.iter().all(|request| request.peer != peer(1)));
    }

    #[test]
    fn test_cancel_expired() {
        let mut requests = OutgoingRequests::new();
        let timeout = Duration::from_secs(60);
        let old = Instant::now() - timeout;
        requests.register(block(0, 0), peer(1), old);
        requests.register(block(0, 1), peer(1), Instant::now());

        let expired = requests.cancel_expired(timeout, Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].block, block(0, 0));
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn test_incoming_dedup_cancel_and_order() {
        let mut requests = IncomingRequests::new();
        assert!(requests.push(peer(1), 0, 0, BLOCK_LEN));
        assert!(!requests.push(peer(1), 0, 0, BLOCK_LEN));
        assert!(requests.push(peer(1), 0, BLOCK_LEN, BLOCK_LEN));
        assert!(requests.push(peer(2), 1, 0, BLOCK_LEN));

        requests.cancel(&peer(1), 0, 0, BLOCK_LEN);
        assert_eq!(requests.len(), 2);

        // the cancelled head is skipped
        let first = requests.pop().unwrap();
        assert_eq!(first.offset, BLOCK_LEN);

        requests.remove_for_peer(&peer(2));
        assert!(requests.pop().is_none());
    }
}
