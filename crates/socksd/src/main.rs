//! `socksd <port> [-p]` — bootstraps the reactor: parses argv, wires
//! `SIGINT`/`SIGTERM` into a self-pipe the reactor can poll, initializes
//! logging, runs until shutdown, and maps startup failures to exit codes.

use std::os::fd::{AsRawFd, FromRawFd};
use std::process::ExitCode;

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::low_level::pipe as signal_pipe;
use socks5_core::reactor::{Reactor, DEFAULT_IDLE_TIMEOUT};

/// A single-threaded, non-blocking SOCKS5 CONNECT relay.
#[derive(Parser, Debug)]
#[command(name = "socksd")]
struct Cli {
    /// TCP port to listen on, 0.0.0.0.
    port: u16,

    /// Enable verbose (debug-level) logging.
    #[arg(short = 'p', long = "print")]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let shutdown_rx = match wire_shutdown_pipe() {
        Ok(rx) => rx,
        Err(e) => {
            tracing::error!(error = %e, "failed to set up shutdown signal pipe");
            return ExitCode::FAILURE;
        }
    };

    let mut reactor = match Reactor::new(cli.port, shutdown_rx, DEFAULT_IDLE_TIMEOUT) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "failed to start reactor");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(port = cli.port, "socksd listening");
    match reactor.run() {
        Ok(()) => {
            tracing::info!("shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "reactor exited with a fatal error");
            ExitCode::FAILURE
        }
    }
}

/// Creates a `mio`-pollable pipe and arms `SIGINT`/`SIGTERM` to write a
/// wakeup byte into its sender half, mirroring the self-pipe trick's classic
/// form: the reactor never touches signals directly, it just polls an fd.
fn wire_shutdown_pipe() -> std::io::Result<mio::unix::pipe::Receiver> {
    let (sender, receiver) = mio::unix::pipe::new()?;
    // SIGINT and SIGTERM each need their own write handle to the same pipe;
    // `dup(2)` the fd rather than sharing the `Sender` value.
    let dup_fd = unsafe { libc::dup(sender.as_raw_fd()) };
    if dup_fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let sender2 = unsafe { mio::unix::pipe::Sender::from_raw_fd(dup_fd) };
    signal_pipe::register(SIGINT, sender)?;
    signal_pipe::register(SIGTERM, sender2)?;
    Ok(receiver)
}

fn init_logging(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
