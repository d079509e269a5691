//! Non-blocking read/write helpers. No global state, no timeouts — the
//! reactor owns both of those.
//!
//! The teacher's `read_frame`/`drain_backlog` split "read/write until the
//! kernel says no more" from "decide what to do next"; these two functions
//! are that same split pulled out as standalone primitives so the handshake
//! state machine and the relay path can share them.

use std::io::{self, Read, Write};

/// Hard cap on a single `read_available` call, matching the reactor's
/// per-pair buffer bound (two of these per relayed pair).
pub const READ_CAP: usize = 16 * 1024;

/// Outcome of draining as much as is currently available from a
/// non-blocking fd.
pub struct ReadOutcome {
    pub bytes: Vec<u8>,
    pub eof: bool,
}

/// Reads from `src` until the kernel reports `WouldBlock`, EOF, or
/// [`READ_CAP`] bytes have been read. `EINTR` is retried transparently.
///
/// A full `READ_CAP` can be returned even though more data may be pending —
/// the caller is expected to re-arm read interest and call again.
pub fn read_available<R: Read>(src: &mut R) -> io::Result<ReadOutcome> {
    let mut buf = Vec::new();
    let mut scratch = [0u8; 4096];
    loop {
        if buf.len() >= READ_CAP {
            return Ok(ReadOutcome { bytes: buf, eof: false });
        }
        let want = scratch.len().min(READ_CAP - buf.len());
        match src.read(&mut scratch[..want]) {
            Ok(0) => return Ok(ReadOutcome { bytes: buf, eof: true }),
            Ok(n) => buf.extend_from_slice(&scratch[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(ReadOutcome { bytes: buf, eof: false });
            }
            Err(e) => return Err(e),
        }
    }
}

/// Writes as much of `bytes` as the kernel accepts without blocking.
/// Returns the unwritten suffix (empty if everything was written).
/// `EINTR` is retried. This never loops until fully drained — that's the
/// reactor's job, driven by write readiness.
pub fn write_all<W: Write>(dst: &mut W, bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut offset = 0;
    while offset < bytes.len() {
        match dst.write(&bytes[offset..]) {
            Ok(0) => break,
            Ok(n) => offset += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(bytes[offset..].to_vec())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn read_available_stops_at_eof() {
        let mut src = Cursor::new(b"hello".to_vec());
        let out = read_available(&mut src).unwrap();
        assert_eq!(out.bytes, b"hello");
        assert!(out.eof);
    }

    #[test]
    fn read_available_caps_at_read_cap() {
        let mut src = Cursor::new(vec![7u8; READ_CAP + 1024]);
        let out = read_available(&mut src).unwrap();
        assert_eq!(out.bytes.len(), READ_CAP);
        assert!(!out.eof);
    }

    #[test]
    fn write_all_drains_fully_when_sink_accepts_everything() {
        let mut sink = Vec::new();
        let remaining = write_all(&mut sink, b"payload").unwrap();
        assert!(remaining.is_empty());
        assert_eq!(sink, b"payload");
    }
}
