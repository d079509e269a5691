//! The per-client handshake state machine: `New` -> `Greeted` ->
//! `Requested`/`AwaitingConnect` -> `Relaying`/`Rejected`.
//!
//! This is a second `impl Reactor` block (see `reactor.rs` for the struct
//! and the mechanics it shares) — the same split the teacher draws between
//! `ConnectionManager`'s dispatch loop and `TcpStream`'s own framing logic,
//! just expressed as two `impl` blocks on one type instead of two types.

use std::net::{Ipv4Addr, SocketAddr};

use mio::net::TcpStream as MioTcpStream;
use mio::Token;

use crate::reactor::Reactor;
use crate::registry::{ConnectionRecord, Phase, Role};
use crate::wire::{self, Address, CodecError, Reply, Status};

impl Reactor {
    /// Drives the `New`/`Greeted` parse loop as far as the buffered bytes
    /// allow, re-entering immediately after each successfully parsed frame
    /// so a pipelined greeting+request arriving in one read is handled
    /// without waiting for another readable event.
    pub(crate) fn drive_handshake(&mut self, token: Token) {
        loop {
            let phase = match self.registry.get(token) {
                Some(r) => r.phase,
                None => return,
            };
            let advanced = match phase {
                Phase::New => self.try_parse_greeting(token),
                Phase::Greeted => self.try_parse_request(token),
                _ => false,
            };
            if !advanced {
                break;
            }
        }
    }

    fn try_parse_greeting(&mut self, token: Token) -> bool {
        let Some(record) = self.registry.get(token) else { return false };
        match wire::decode_greeting(&record.parse_buf) {
            Ok((greeting, consumed)) => {
                if let Some(r) = self.registry.get_mut(token) {
                    let remainder = r.parse_buf.split_off(consumed);
                    r.parse_buf = remainder;
                }
                let mut out = Vec::new();
                if greeting.offers_no_auth() {
                    wire::encode_method_selection(&mut out, wire::METHOD_NO_AUTH);
                    if let Some(r) = self.registry.get_mut(token) {
                        r.phase = Phase::Greeted;
                    }
                    self.enqueue_client_outbound(token, out);
                    true
                } else {
                    wire::encode_method_selection(&mut out, wire::METHOD_NO_ACCEPTABLE);
                    if let Some(r) = self.registry.get_mut(token) {
                        r.phase = Phase::Rejected;
                    }
                    self.enqueue_client_outbound(token, out);
                    false
                }
            }
            Err(CodecError::Truncated) => false,
            Err(e) => {
                tracing::debug!(?token, error = %e, "bad greeting, closing without reply");
                self.close_connection(token);
                false
            }
        }
    }

    fn try_parse_request(&mut self, token: Token) -> bool {
        let Some(record) = self.registry.get(token) else { return false };
        match wire::decode_request(&record.parse_buf) {
            Ok((request, consumed)) => {
                let leftover = self
                    .registry
                    .get_mut(token)
                    .map(|r| {
                        let leftover = r.parse_buf.split_off(consumed);
                        r.parse_buf.clear();
                        leftover
                    })
                    .unwrap_or_default();
                if let Some(r) = self.registry.get_mut(token) {
                    r.pending_payload = leftover;
                }
                self.begin_connect(token, request);
                // Whatever comes next (a connect in flight, or a rejection)
                // is not another handshake frame, so the parse loop ends
                // here regardless of outcome.
                false
            }
            Err(CodecError::Truncated) => false,
            Err(e) => {
                tracing::debug!(?token, error = %e, "bad request, rejecting");
                self.reject_client(token, Status::GeneralFailure);
                false
            }
        }
    }

    /// Issues the non-blocking outbound connect and either pairs the client
    /// with a new `TargetFacing` record in `AwaitingConnect`, or rejects the
    /// client immediately if the request can't be satisfied at all (domain
    /// lookups are out of scope; see spec.md §4.4, Non-goals).
    fn begin_connect(&mut self, client: Token, request: wire::Request) {
        let Address::V4(octets) = &request.address else {
            self.reject_client(client, Status::GeneralFailure);
            return;
        };
        let addr = SocketAddr::from((Ipv4Addr::from(*octets), request.port));
        match MioTcpStream::connect(addr) {
            Ok(stream) => {
                let target = self.registry.insert(ConnectionRecord::new(Role::TargetFacing, Phase::AwaitingConnect));
                if let Err(e) = self.register_connect(target, stream) {
                    tracing::warn!(?target, error = %e, "failed to register outbound connect");
                    self.registry.remove(target);
                    self.reject_client(client, Status::GeneralFailure);
                    return;
                }
                self.registry.pair(client, target);
                if let Some(r) = self.registry.get_mut(target) {
                    r.pending_request = Some(request);
                }
                // Client stays in `Greeted` — it transitions to `Requested`
                // only once the reply is actually enqueued, in
                // `handle_connect_writable`.
            }
            Err(e) => {
                let status = crate::error::status_for_connect_error(&e);
                self.reject_client(client, status);
            }
        }
    }

    /// Builds and enqueues a failure reply, moving the client to `Rejected`
    /// (closed by the generic drain path once the reply is out).
    fn reject_client(&mut self, client: Token, status: Status) {
        if let Some(r) = self.registry.get_mut(client) {
            r.phase = Phase::Rejected;
        }
        let mut out = Vec::new();
        wire::encode_reply(&mut out, &Reply::failure(status));
        self.enqueue_client_outbound(client, out);
    }

    /// Writable notification for a `TargetFacing` fd in `AwaitingConnect`:
    /// resolves the non-blocking connect via `take_error` and either moves
    /// the pair into `Relaying` with a success reply, or tears the pair down
    /// with a mapped failure reply.
    pub(crate) fn handle_connect_writable(&mut self, target: Token) {
        let client = self.registry.get(target).and_then(|r| r.peer);
        let outcome = self.take_error_on(target);
        match outcome {
            Ok(None) => {
                if let Some(r) = self.registry.get_mut(target) {
                    r.phase = Phase::Relaying;
                    // Read-gated until the client's success reply fully
                    // drains: otherwise a relay read here could race ahead
                    // of an undrained reply on the client fd and clobber it
                    // via `forward_bytes`, violating reply-before-payload.
                    // `rearm_peer_read` (triggered when the client's
                    // outbound empties) re-arms this.
                    r.read_armed = false;
                }
                self.sync_interest(target);
                let Some(client) = client else {
                    self.close_connection(target);
                    return;
                };
                let Some(request) = self.registry.get_mut(target).and_then(|r| r.pending_request.take()) else {
                    return;
                };
                if let Some(r) = self.registry.get_mut(client) {
                    r.phase = Phase::Requested;
                }
                let mut out = Vec::new();
                wire::encode_reply(&mut out, &Reply::success(&request));
                self.enqueue_client_outbound(client, out);
            }
            Ok(Some(err)) | Err(err) => {
                let status = crate::error::status_for_connect_error(&err);
                tracing::debug!(?target, error = %err, "outbound connect failed");
                self.close_connection(target);
                if let Some(client) = client {
                    if let Some(r) = self.registry.get_mut(client) {
                        r.peer = None;
                    }
                    self.reject_client(client, status);
                }
            }
        }
    }
}
