//! Per-fd connection state, fused into one record per `mio::Token` and held
//! in a dense arena indexed by the token's raw value.
//!
//! The source kept a translation table and a status table as separate
//! fixed-size C arrays, keyed by raw fd. Per the redesign guidance, those
//! are fused here into one [`ConnectionRecord`], and the token replaces the
//! raw fd as the key into a `Vec<Option<ConnectionRecord>>` arena — reusing
//! freed slots instead of ever resizing down.

use mio::Token;

/// Minimum number of simultaneously relayed pairs the arena is sized for.
pub const MAX_PAIRS: usize = 510;
/// `2 * MAX_PAIRS` (client + target fd per pair) plus listener, signal-pipe
/// read end, and one spare slot.
pub const INITIAL_CAPACITY: usize = 2 * MAX_PAIRS + 3;

pub const LISTENER_TOKEN: Token = Token(0);
pub const SIGNAL_TOKEN: Token = Token(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    SignalReader,
    ClientFacing,
    TargetFacing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Only meaningful for `ClientFacing`: awaiting the greeting.
    New,
    /// Only meaningful for `ClientFacing`: awaiting the request.
    Greeted,
    /// Only meaningful for `ClientFacing`: reply enqueued, waiting for it
    /// to drain and for the paired target to finish connecting.
    Requested,
    /// Only meaningful for `TargetFacing`: non-blocking connect in flight.
    AwaitingConnect,
    /// Meaningful for both roles once the pair is established.
    Relaying,
    /// Only meaningful for `ClientFacing`: handshake failed, closing once
    /// any final reply drains.
    Rejected,
}

/// One tracked fd's full state.
pub struct ConnectionRecord {
    pub role: Role,
    pub phase: Phase,
    pub peer: Option<Token>,
    /// Pending bytes to write once this fd is writable. At most one buffer
    /// queued per fd (invariant 3 in spec.md §3).
    pub outbound: Option<Vec<u8>>,
    /// Mirrors whether this fd is currently registered for write interest.
    pub want_write: bool,
    /// Read interest is cleared (read-gated) while the peer's outbound
    /// buffer is non-empty, to bound memory per pair.
    pub read_armed: bool,

    // --- reactor bookkeeping below; not part of the formal data model, but
    // needed to drive it without re-deriving state on every event. ---
    /// Whether `mio::Registry` currently holds an interest registration for
    /// this fd at all (vs. fully deregistered while idle on both ends).
    pub registered: bool,
    /// `ClientFacing`, `New`/`Greeted`: accumulates bytes until a full
    /// greeting/request frame can be decoded.
    pub parse_buf: Vec<u8>,
    /// `ClientFacing`: bytes left over after the request frame was parsed
    /// out of `parse_buf` — the pipelined first relay payload, forwarded
    /// once the pair enters `Relaying`.
    pub pending_payload: Vec<u8>,
    /// `TargetFacing`, `AwaitingConnect`: the request to echo back in the
    /// success reply once the connect resolves.
    pub pending_request: Option<crate::wire::Request>,
    /// Set on EOF from a peer whose outbound still has data queued; once
    /// that queue fully drains the pair closes together.
    pub close_after_drain: bool,
}

impl ConnectionRecord {
    pub fn new(role: Role, phase: Phase) -> Self {
        Self {
            role,
            phase,
            peer: None,
            outbound: None,
            want_write: false,
            read_armed: true,
            registered: false,
            parse_buf: Vec::new(),
            pending_payload: Vec::new(),
            pending_request: None,
            close_after_drain: false,
        }
    }
}

/// Dense arena mapping `Token` -> `ConnectionRecord`, with a free list for
/// slot reuse so the arena never needs to shrink.
#[derive(Default)]
pub struct Registry {
    slots: Vec<Option<ConnectionRecord>>,
    free: Vec<usize>,
}

impl Registry {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(INITIAL_CAPACITY);
        slots.resize_with(INITIAL_CAPACITY, || None);
        Self { slots, free: Vec::new() }
    }

    /// Inserts at a specific, already-known token (used for the two
    /// well-known fds).
    pub fn insert_at(&mut self, token: Token, record: ConnectionRecord) {
        if token.0 >= self.slots.len() {
            self.slots.resize_with(token.0 + 1, || None);
        }
        self.slots[token.0] = Some(record);
    }

    /// Inserts a new record, reusing a freed slot if one exists, and
    /// returns the token assigned to it.
    pub fn insert(&mut self, record: ConnectionRecord) -> Token {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(record);
            return Token(idx);
        }
        let idx = self.slots.len();
        self.slots.push(Some(record));
        Token(idx)
    }

    pub fn get(&self, token: Token) -> Option<&ConnectionRecord> {
        self.slots.get(token.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut ConnectionRecord> {
        self.slots.get_mut(token.0).and_then(Option::as_mut)
    }

    /// Removes a record, freeing its slot for reuse. The two well-known
    /// tokens are never removed by callers.
    pub fn remove(&mut self, token: Token) -> Option<ConnectionRecord> {
        let slot = self.slots.get_mut(token.0)?;
        let record = slot.take()?;
        self.free.push(token.0);
        Some(record)
    }

    /// Sets `a` and `b` as each other's peer (invariant 1: symmetry).
    pub fn pair(&mut self, a: Token, b: Token) {
        if let Some(rec) = self.get_mut(a) {
            rec.peer = Some(b);
        }
        if let Some(rec) = self.get_mut(b) {
            rec.peer = Some(a);
        }
    }

    /// Checks invariant 1 (peer symmetry) across every tracked record. Used
    /// by tests as a whole-registry sanity check between reactor
    /// iterations.
    pub fn peers_symmetric(&self) -> bool {
        for (idx, slot) in self.slots.iter().enumerate() {
            let Some(record) = slot else { continue };
            if let Some(peer) = record.peer {
                match self.get(peer) {
                    Some(peer_record) if peer_record.peer == Some(Token(idx)) => {}
                    _ => return false,
                }
            }
        }
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (Token, &ConnectionRecord)> {
        self.slots.iter().enumerate().filter_map(|(idx, slot)| slot.as_ref().map(|r| (Token(idx), r)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_remove_round_trips_slot() {
        let mut reg = Registry::new();
        let token = reg.insert(ConnectionRecord::new(Role::ClientFacing, Phase::New));
        assert!(reg.get(token).is_some());
        reg.remove(token);
        assert!(reg.get(token).is_none());
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut reg = Registry::new();
        let t1 = reg.insert(ConnectionRecord::new(Role::ClientFacing, Phase::New));
        reg.remove(t1);
        let t2 = reg.insert(ConnectionRecord::new(Role::ClientFacing, Phase::New));
        assert_eq!(t1, t2);
    }

    #[test]
    fn pair_is_symmetric() {
        let mut reg = Registry::new();
        let a = reg.insert(ConnectionRecord::new(Role::ClientFacing, Phase::Relaying));
        let b = reg.insert(ConnectionRecord::new(Role::TargetFacing, Phase::Relaying));
        reg.pair(a, b);
        assert_eq!(reg.get(a).unwrap().peer, Some(b));
        assert_eq!(reg.get(b).unwrap().peer, Some(a));
        assert!(reg.peers_symmetric());
    }

    #[test]
    fn asymmetric_peer_is_detected() {
        let mut reg = Registry::new();
        let a = reg.insert(ConnectionRecord::new(Role::ClientFacing, Phase::Relaying));
        let b = reg.insert(ConnectionRecord::new(Role::TargetFacing, Phase::Relaying));
        reg.get_mut(a).unwrap().peer = Some(b);
        // b -> a link intentionally left unset.
        assert!(!reg.peers_symmetric());
    }
}
