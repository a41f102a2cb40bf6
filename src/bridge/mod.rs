//! Stdio-to-TCP bridge.
//!
//! Assistant clients launch `imcp-server` and speak JSON-RPC over its
//! stdin/stdout; this module carries those bytes to the daemon's loopback
//! port. Two pump tasks run under one supervisor — whichever finishes
//! first (EOF, error, idle timeout) cancels the other and tears the
//! connection down.
//!
//! The network-inbound path filters the binary heartbeat sideband and
//! re-frames the remaining bytes so stdout only ever sees complete
//! newline-terminated messages.

use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::mcp::heartbeat;
use crate::server::port_file;
use crate::server::session::is_disconnect;

/// Upper bound on a single network receive.
const MAX_CHUNK: usize = 1024 * 1024;

/// Stdin read buffer size.
const STDIN_CHUNK: usize = 64 * 1024;

/// No bytes from the server for this long counts as an unclassified
/// timeout and triggers a reconnect. The server heartbeats every 30
/// seconds, so three missed probes means the link is dead.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Delay before reconnecting after an idle timeout.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Delay before retrying after an unclassified error.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Why a pump direction finished.
#[derive(Debug, PartialEq, Eq)]
pub enum PumpEnd {
    /// The server closed the connection (clean shutdown).
    RemoteClosed,
    /// stdin hit EOF — the assistant client is gone.
    StdinClosed,
    /// Nothing received for [`READ_IDLE_TIMEOUT`].
    IdleTimeout,
}

// ---------------------------------------------------------------------------
// Heartbeat filtering and framing
// ---------------------------------------------------------------------------

/// Remove complete heartbeat frames from a received chunk.
///
/// Returns `None` when the heartbeat signature is present but the chunk
/// ends before the full 12-byte frame: the whole chunk is discarded and
/// the stream resynchronizes on the next newline.
pub fn strip_heartbeats(input: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i..].starts_with(&heartbeat::MAGIC) {
            if input.len() - i >= heartbeat::FRAME_LEN {
                i += heartbeat::FRAME_LEN;
                continue;
            }
            return None;
        }
        out.push(input[i]);
        i += 1;
    }
    Some(out)
}

/// Drain every complete newline-terminated message from the rolling
/// buffer, each returned with its terminating newline. Trailing partial
/// data stays in the buffer.
pub fn drain_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let rest = buffer.split_off(pos + 1);
        lines.push(std::mem::replace(buffer, rest));
    }
    lines
}

// ---------------------------------------------------------------------------
// Pump directions
// ---------------------------------------------------------------------------

/// stdin -> network. Whitespace-only input is held back so stray blank
/// lines never hit the wire.
async fn pump_outbound<I, W>(mut input: I, mut net: W) -> io::Result<PumpEnd>
where
    I: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; STDIN_CHUNK];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            return Ok(PumpEnd::StdinClosed);
        }
        pending.extend_from_slice(&buf[..n]);
        if pending.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        net.write_all(&pending).await?;
        net.flush().await?;
        pending.clear();
    }
}

/// network -> stdout. Heartbeats stripped, complete messages written as
/// whole units.
async fn pump_inbound<R, W>(mut net: R, mut output: W) -> io::Result<PumpEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunk = vec![0u8; MAX_CHUNK];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = match timeout(READ_IDLE_TIMEOUT, net.read(&mut chunk)).await {
            Ok(result) => result?,
            Err(_) => return Ok(PumpEnd::IdleTimeout),
        };
        if n == 0 {
            return Ok(PumpEnd::RemoteClosed);
        }

        match strip_heartbeats(&chunk[..n]) {
            Some(bytes) => pending.extend_from_slice(&bytes),
            None => {
                debug!("Dropped chunk with partial heartbeat frame");
                continue;
            }
        }

        let lines = drain_lines(&mut pending);
        if lines.is_empty() {
            continue;
        }
        for line in lines {
            output.write_all(&line).await?;
        }
        output.flush().await?;
    }
}

/// Run both directions until the first one finishes; the loser is
/// cancelled by drop.
pub async fn pump<NR, NW, I, O>(net_r: NR, net_w: NW, input: I, output: O) -> io::Result<PumpEnd>
where
    NR: AsyncRead + Unpin,
    NW: AsyncWrite + Unpin,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    tokio::select! {
        result = pump_outbound(input, net_w) => result,
        result = pump_inbound(net_r, output) => result,
    }
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

/// Connect, send the token preamble, and pump stdio until something ends.
async fn connect_and_pump(port: u16, token: &str) -> io::Result<PumpEnd> {
    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;

    // Token line goes out before any JSON-RPC byte.
    stream.write_all(token.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;

    let (net_r, net_w) = stream.into_split();
    pump(net_r, net_w, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Bridge entry point: resolve the port, connect, and keep the stream
/// alive until the remote end or stdin closes for good.
///
/// Retry policy: connection-reset / not-connected errors terminate the
/// bridge; idle timeouts reconnect after a brief delay; anything else
/// retries after five seconds.
pub async fn run(token: &str, support_dir: &Path) -> anyhow::Result<()> {
    loop {
        let port = port_file::read_with_timeout(support_dir, port_file::READ_TIMEOUT)
            .await
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no server port file at {} — is the iMCP daemon running?",
                    port_file::path(support_dir).display()
                )
            })?;

        info!(port, "Connecting to 127.0.0.1");
        match connect_and_pump(port, token).await {
            Ok(PumpEnd::RemoteClosed) => {
                info!("Server closed the connection, exiting");
                return Ok(());
            }
            Ok(PumpEnd::StdinClosed) => {
                info!("stdin closed, exiting");
                return Ok(());
            }
            Ok(PumpEnd::IdleTimeout) => {
                warn!("Connection idle too long, reconnecting");
                sleep(RECONNECT_DELAY).await;
            }
            Err(e) if is_disconnect(e.kind()) => {
                return Err(anyhow::anyhow!("connection lost: {}", e));
            }
            Err(e) => {
                warn!(error = %e, "Bridge error, retrying in {:?}", RETRY_DELAY);
                sleep(RETRY_DELAY).await;
            }
        }
    }
}
