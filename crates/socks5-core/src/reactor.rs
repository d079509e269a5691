//! The single-threaded event loop: owns the `mio::Poll` instance, the
//! listener, the shutdown self-pipe, and every tracked connection's socket.
//!
//! Split the way the teacher splits `TcpConnector` (mechanics: accept,
//! dispatch, drain, close) from `TcpStream` (per-connection framing): this
//! file is the mechanics; `handshake.rs` holds the protocol-specific half of
//! `impl Reactor` in a second `impl` block.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Events, Interest, Poll, Token};

use crate::error::CoreError;
use crate::registry::{ConnectionRecord, Phase, Registry, Role, LISTENER_TOKEN, SIGNAL_TOKEN};

/// Default idle timeout: if a whole `poll()` cycle returns no events within
/// this window, the reactor shuts itself down (see spec.md §4.3, Edge case:
/// "no connections, and no shutdown signal, for an extended period").
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// The concrete OS handle behind a tracked token. Kept out of
/// [`ConnectionRecord`] so the data model in `registry.rs` stays pure state,
/// with the reactor the only thing that touches actual fds.
pub(crate) enum Socket {
    Listener(MioTcpListener),
    Signal(mio::unix::pipe::Receiver),
    Stream(MioTcpStream),
}

impl Socket {
    fn source_mut(&mut self) -> &mut dyn mio::event::Source {
        match self {
            Socket::Listener(l) => l,
            Socket::Signal(s) => s,
            Socket::Stream(s) => s,
        }
    }
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    pub(crate) registry: Registry,
    sockets: Vec<Option<Socket>>,
    pub(crate) shutdown: bool,
    idle_timeout: Duration,
}

impl Reactor {
    /// Binds `0.0.0.0:port` and registers the listener and the already-armed
    /// shutdown pipe receiver at their well-known tokens.
    pub fn new(
        port: u16,
        shutdown_rx: mio::unix::pipe::Receiver,
        idle_timeout: Duration,
    ) -> Result<Self, CoreError> {
        let poll = Poll::new().map_err(CoreError::PollSetup)?;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let mut listener = MioTcpListener::bind(addr).map_err(|source| CoreError::Bind { addr, source })?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(CoreError::PollSetup)?;

        let mut shutdown_rx = shutdown_rx;
        poll.registry()
            .register(&mut shutdown_rx, SIGNAL_TOKEN, Interest::READABLE)
            .map_err(CoreError::SignalPipeSetup)?;

        let mut registry = Registry::new();
        let mut listener_record = ConnectionRecord::new(Role::Listener, Phase::New);
        listener_record.registered = true;
        registry.insert_at(LISTENER_TOKEN, listener_record);
        let mut signal_record = ConnectionRecord::new(Role::SignalReader, Phase::New);
        signal_record.registered = true;
        registry.insert_at(SIGNAL_TOKEN, signal_record);

        let mut sockets = Vec::new();
        sockets.resize_with(2, || None);
        sockets[LISTENER_TOKEN.0] = Some(Socket::Listener(listener));
        sockets[SIGNAL_TOKEN.0] = Some(Socket::Signal(shutdown_rx));

        Ok(Self { poll, events: Events::with_capacity(128), registry, sockets, shutdown: false, idle_timeout })
    }

    /// The listener's bound local address — mainly useful when constructed
    /// with port `0` and the caller needs to learn the OS-assigned port
    /// (tests, and logging the effective bind address at startup).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.sockets[LISTENER_TOKEN.0] {
            Some(Socket::Listener(l)) => l.local_addr(),
            _ => Err(io::Error::other("listener socket missing")),
        }
    }

    /// Runs until a shutdown signal arrives, the idle timeout elapses, or a
    /// reactor-fatal error occurs (listener accept failure, poll failure).
    pub fn run(&mut self) -> Result<(), CoreError> {
        loop {
            self.poll.poll(&mut self.events, Some(self.idle_timeout)).map_err(CoreError::PollWait)?;

            if self.events.iter().next().is_none() {
                tracing::info!("idle timeout elapsed with no activity, shutting down");
                break;
            }

            let mut ready: Vec<(Token, bool, bool)> =
                self.events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();
            ready.sort_by_key(|(token, _, _)| token.0);
            ready.dedup_by_key(|(token, _, _)| *token);

            for (token, readable, writable) in ready {
                self.dispatch(token, readable, writable)?;
                if self.shutdown {
                    break;
                }
            }
            if self.shutdown {
                break;
            }
        }
        self.drain_and_close_all();
        Ok(())
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) -> Result<(), CoreError> {
        if token == LISTENER_TOKEN {
            if readable {
                self.accept_loop()?;
            }
            return Ok(());
        }
        if token == SIGNAL_TOKEN {
            if readable {
                self.drain_signal_pipe();
                self.shutdown = true;
            }
            return Ok(());
        }
        let Some(record) = self.registry.get(token) else {
            // Stale event for an fd already closed earlier this batch.
            return Ok(());
        };
        if record.role == Role::TargetFacing && record.phase == Phase::AwaitingConnect {
            if writable {
                self.handle_connect_writable(token);
            }
            return Ok(());
        }
        if writable {
            self.handle_writable(token);
        }
        if readable && self.registry.get(token).is_some() {
            self.handle_readable(token);
        }
        Ok(())
    }

    fn accept_loop(&mut self) -> Result<(), CoreError> {
        loop {
            let Some(Socket::Listener(listener)) = self.sockets[LISTENER_TOKEN.0].as_mut() else {
                unreachable!("listener token never holds another socket variant")
            };
            match listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    let token = self.registry.insert(ConnectionRecord::new(Role::ClientFacing, Phase::New));
                    if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
                        tracing::warn!(?token, error = %e, "failed to register accepted client, dropping it");
                        self.registry.remove(token);
                        continue;
                    }
                    if let Some(record) = self.registry.get_mut(token) {
                        record.registered = true;
                    }
                    self.set_socket(token, Socket::Stream(stream));
                    tracing::debug!(?token, %peer_addr, "accepted client connection");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(error = %e, "listener accept failed, reactor shutting down");
                    return Err(CoreError::PollWait(e));
                }
            }
        }
    }

    fn drain_signal_pipe(&mut self) {
        if let Some(Socket::Signal(rx)) = self.sockets[SIGNAL_TOKEN.0].as_mut() {
            // Contents are irrelevant; a single byte written by the signal
            // handler is what wakes the reactor. Drain so the fd doesn't
            // stay perpetually readable.
            let _ = crate::io::read_available(rx);
        }
    }

    // --- helpers shared with handshake.rs ---

    pub(crate) fn set_socket(&mut self, token: Token, socket: Socket) {
        if token.0 >= self.sockets.len() {
            self.sockets.resize_with(token.0 + 1, || None);
        }
        self.sockets[token.0] = Some(socket);
    }

    fn socket_mut(&mut self, token: Token) -> Option<&mut Socket> {
        self.sockets.get_mut(token.0).and_then(Option::as_mut)
    }

    fn take_socket(&mut self, token: Token) -> Option<Socket> {
        self.sockets.get_mut(token.0).and_then(Option::take)
    }

    /// Recomputes the fd's desired interest from `read_armed` and whether it
    /// has an outbound buffer queued, and (re)registers/deregisters to match.
    pub(crate) fn sync_interest(&mut self, token: Token) {
        let Some(record) = self.registry.get(token) else { return };
        if record.role == Role::Listener || record.role == Role::SignalReader {
            return;
        }
        let readable = record.read_armed;
        let writable = record.outbound.is_some();
        let was_registered = record.registered;
        let interest = match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        let Some(socket) = self.sockets.get_mut(token.0).and_then(Option::as_mut) else { return };
        let source = socket.source_mut();
        let result = match (interest, was_registered) {
            (Some(i), true) => self.poll.registry().reregister(source, token, i),
            (Some(i), false) => self.poll.registry().register(source, token, i),
            (None, true) => self.poll.registry().deregister(source),
            (None, false) => Ok(()),
        };
        if let Err(e) = result {
            tracing::debug!(?token, error = %e, "interest sync failed");
            return;
        }
        if let Some(record) = self.registry.get_mut(token) {
            record.registered = interest.is_some();
            record.want_write = writable;
        }
    }

    /// Generic write-drain: flushes a queued outbound buffer as far as the
    /// kernel accepts it right now. Used for relay payload, handshake
    /// replies, and method-selection frames alike.
    pub(crate) fn handle_writable(&mut self, token: Token) {
        let Some(bytes) = self.registry.get_mut(token).and_then(|r| r.outbound.take()) else {
            self.sync_interest(token);
            return;
        };
        let remaining = {
            let Some(socket) = self.socket_mut(token) else { return };
            match write_bytes(socket, &bytes) {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(?token, error = %e, "write failed, closing");
                    self.close_pair(token);
                    return;
                }
            }
        };
        if remaining.is_empty() {
            if let Some(r) = self.registry.get_mut(token) {
                r.outbound = None;
            }
            self.sync_interest(token);
            self.rearm_peer_read(token);
            self.after_drain(token);
        } else if let Some(r) = self.registry.get_mut(token) {
            r.outbound = Some(remaining);
        }
    }

    /// Once `token`'s outbound is fully drained, its peer (the original
    /// sender, if any) is re-armed for reads — it may have been read-gated
    /// while this buffer was still in flight.
    fn rearm_peer_read(&mut self, token: Token) {
        let Some(peer) = self.registry.get(token).and_then(|r| r.peer) else { return };
        if let Some(r) = self.registry.get_mut(peer) {
            r.read_armed = true;
        }
        self.sync_interest(peer);
    }

    /// Post-drain bookkeeping: close a `Rejected` record, close a half-closed
    /// pair, or complete a client's handshake now that its reply is out.
    fn after_drain(&mut self, token: Token) {
        let Some(record) = self.registry.get(token) else { return };
        if record.phase == Phase::Rejected {
            self.close_connection(token);
            return;
        }
        if record.close_after_drain {
            self.close_pair(token);
            return;
        }
        if record.phase == Phase::Requested {
            self.try_complete_client(token);
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let Some(record) = self.registry.get(token) else { return };
        match record.phase {
            Phase::New | Phase::Greeted => self.handshake_read(token),
            Phase::Relaying => self.relay_read(token),
            _ => {}
        }
    }

    /// Reads from a relaying fd and forwards whatever arrived to its peer;
    /// on EOF, either closes the pair now or, if the peer still has data in
    /// flight, defers the close until that buffer drains (the half-close
    /// rule in spec.md §4.4).
    fn relay_read(&mut self, token: Token) {
        let Some(peer) = self.registry.get(token).and_then(|r| r.peer) else { return };
        let outcome = {
            let Some(socket) = self.socket_mut(token) else { return };
            match read_bytes(socket) {
                Ok(o) => o,
                Err(e) => {
                    tracing::debug!(?token, error = %e, "relay read failed, closing pair");
                    self.close_pair(token);
                    return;
                }
            }
        };
        if !outcome.bytes.is_empty() {
            self.forward_bytes(token, peer, outcome.bytes);
        }
        if outcome.eof {
            let peer_pending = self.registry.get(peer).map(|r| r.outbound.is_some()).unwrap_or(false);
            if peer_pending {
                if let Some(r) = self.registry.get_mut(peer) {
                    r.close_after_drain = true;
                }
                if let Some(r) = self.registry.get_mut(token) {
                    r.read_armed = false;
                }
                self.sync_interest(token);
            } else {
                self.close_pair(token);
            }
        }
    }

    /// Reads newly arrived bytes into the handshake parse buffer and drives
    /// the greeting/request state machine (see `handshake.rs`) as far as it
    /// can go with what's buffered.
    fn handshake_read(&mut self, token: Token) {
        let outcome = {
            let Some(socket) = self.socket_mut(token) else { return };
            match read_bytes(socket) {
                Ok(o) => o,
                Err(e) => {
                    tracing::debug!(?token, error = %e, "handshake read failed, closing");
                    self.close_connection(token);
                    return;
                }
            }
        };
        if let Some(r) = self.registry.get_mut(token) {
            r.parse_buf.extend_from_slice(&outcome.bytes);
        }
        self.drive_handshake(token);
        if outcome.eof {
            let still_mid_handshake =
                matches!(self.registry.get(token).map(|r| r.phase), Some(Phase::New) | Some(Phase::Greeted));
            if still_mid_handshake {
                self.close_connection(token);
            }
        }
    }

    /// Enqueues `bytes` on `to`'s outbound and attempts to drain them
    /// immediately; if they don't fully drain, read-gates `from` until they
    /// do (bounding the pair's buffered memory to one payload in flight).
    pub(crate) fn forward_bytes(&mut self, from: Token, to: Token, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        if let Some(r) = self.registry.get_mut(to) {
            r.outbound = Some(bytes);
        }
        self.sync_interest(to);
        self.handle_writable(to);
        let still_pending = self.registry.get(to).map(|r| r.outbound.is_some()).unwrap_or(false);
        if still_pending {
            if let Some(r) = self.registry.get_mut(from) {
                r.read_armed = false;
            }
            self.sync_interest(from);
        }
    }

    /// Sets `bytes` as `token`'s outbound and drains it immediately,
    /// triggering any phase transition that depends on the drain completing
    /// synchronously (handled by [`Reactor::after_drain`]).
    pub(crate) fn enqueue_client_outbound(&mut self, token: Token, bytes: Vec<u8>) {
        if let Some(r) = self.registry.get_mut(token) {
            r.outbound = Some(bytes);
        }
        self.sync_interest(token);
        self.handle_writable(token);
    }

    pub(crate) fn close_pair(&mut self, token: Token) {
        let peer = self.registry.get(token).and_then(|r| r.peer);
        self.close_connection(token);
        if let Some(peer) = peer {
            self.close_connection(peer);
        }
    }

    pub(crate) fn close_connection(&mut self, token: Token) {
        if token == LISTENER_TOKEN || token == SIGNAL_TOKEN {
            return;
        }
        if let Some(mut socket) = self.take_socket(token) {
            let _ = self.poll.registry().deregister(socket.source_mut());
        }
        self.registry.remove(token);
    }

    /// Shutdown path: one best-effort flush per queued buffer, then close
    /// everything, well-known fds included.
    fn drain_and_close_all(&mut self) {
        let tokens: Vec<Token> = self.registry.iter().map(|(t, _)| t).collect();
        for token in tokens {
            if token == LISTENER_TOKEN || token == SIGNAL_TOKEN {
                continue;
            }
            if let Some(bytes) = self.registry.get_mut(token).and_then(|r| r.outbound.take()) {
                if let Some(socket) = self.socket_mut(token) {
                    let _ = write_bytes(socket, &bytes);
                }
            }
            if let Some(mut socket) = self.take_socket(token) {
                let _ = self.poll.registry().deregister(socket.source_mut());
            }
            self.registry.remove(token);
        }
        for token in [LISTENER_TOKEN, SIGNAL_TOKEN] {
            if let Some(mut socket) = self.take_socket(token) {
                let _ = self.poll.registry().deregister(socket.source_mut());
            }
            self.registry.remove(token);
        }
    }

    // --- used by handshake.rs ---

    pub(crate) fn register_connect(&mut self, token: Token, stream: MioTcpStream) -> io::Result<()> {
        let mut stream = stream;
        self.poll.registry().register(&mut stream, token, Interest::WRITABLE)?;
        self.set_socket(token, Socket::Stream(stream));
        if let Some(r) = self.registry.get_mut(token) {
            r.registered = true;
            r.want_write = true;
        }
        Ok(())
    }

    pub(crate) fn take_error_on(&mut self, token: Token) -> io::Result<Option<io::Error>> {
        match self.socket_mut(token) {
            Some(Socket::Stream(s)) => s.take_error(),
            _ => Ok(None),
        }
    }

    fn try_complete_client(&mut self, client: Token) {
        let Some(peer) = self.registry.get(client).and_then(|r| r.peer) else { return };
        let peer_relaying = self.registry.get(peer).map(|r| r.phase == Phase::Relaying).unwrap_or(false);
        if !peer_relaying {
            return;
        }
        if let Some(r) = self.registry.get_mut(client) {
            r.phase = Phase::Relaying;
        }
        let leftover = self.registry.get_mut(client).map(|r| std::mem::take(&mut r.pending_payload)).unwrap_or_default();
        if !leftover.is_empty() {
            self.forward_bytes(client, peer, leftover);
        }
    }
}

fn read_bytes(socket: &mut Socket) -> io::Result<crate::io::ReadOutcome> {
    match socket {
        Socket::Stream(s) => crate::io::read_available(s),
        Socket::Signal(s) => crate::io::read_available(s),
        Socket::Listener(_) => unreachable!("listener is never read via read_bytes"),
    }
}

fn write_bytes(socket: &mut Socket, bytes: &[u8]) -> io::Result<Vec<u8>> {
    match socket {
        Socket::Stream(s) => crate::io::write_all(s, bytes),
        _ => unreachable!("only Stream sockets carry an outbound buffer"),
    }
}
