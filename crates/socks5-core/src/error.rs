//! Reactor-fatal errors and the OS-error-to-SOCKS5-status mapping.
//!
//! Mirrors `flux-communication::error`'s split between a small, focused
//! error enum per failure domain rather than one catch-all type.

use std::io;

use thiserror::Error;

use crate::wire::Status;

/// Errors that abort the whole reactor. Per-connection I/O errors never
/// produce one of these — they're handled inline by closing the
/// connection (see `handshake` and `reactor`).
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind { addr: std::net::SocketAddr, #[source] source: io::Error },
    #[error("failed to construct poll registry: {0}")]
    PollSetup(#[source] io::Error),
    #[error("failed to register self-pipe for shutdown: {0}")]
    SignalPipeSetup(#[source] io::Error),
    #[error("poll wait failed: {0}")]
    PollWait(#[source] io::Error),
}

/// Maps a failed outbound connect's OS error to a SOCKS5 reply status, per
/// the table in §4.5: `ECONNREFUSED -> 0x05`, `ENETUNREACH -> 0x03`,
/// anything else -> `0x01`.
pub fn status_for_connect_error(err: &io::Error) -> Status {
    match err.raw_os_error() {
        Some(code) if code == libc::ECONNREFUSED => Status::ConnectionRefused,
        Some(code) if code == libc::ENETUNREACH => Status::NetworkUnreachable,
        _ => Status::GeneralFailure,
    }
}
