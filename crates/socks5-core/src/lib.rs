//! Single-threaded, non-blocking SOCKS5 relay: wire codec, buffered I/O
//! primitives, connection registry, handshake state machine, and the
//! reactor that drives them all from one `mio::Poll` loop.

pub mod error;
pub mod io;
pub mod reactor;
pub mod registry;
pub mod wire;

// No public API of its own — a second `impl Reactor` block split out by
// concern (see the module doc comment in reactor.rs).
mod handshake;

pub use error::CoreError;
pub use reactor::{Reactor, DEFAULT_IDLE_TIMEOUT};
pub use registry::{MAX_PAIRS, INITIAL_CAPACITY};
