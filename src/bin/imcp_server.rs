//! Stdio-to-TCP bridge binary.
//!
//! Assistant clients launch this executable; stdin/stdout carry the
//! JSON-RPC stream and stderr carries logs only. The bridge reads the
//! daemon's port file, connects to the loopback port, and sends the token
//! line before any protocol traffic.
//!
//! Exit status is 0 when the remote end (or stdin) closes cleanly and
//! non-zero on unrecoverable errors.

use clap::Parser;
use tracing::warn;

#[derive(Parser)]
#[command(name = "imcp-server", version, about = "Bridge stdio JSON-RPC to the iMCP daemon")]
struct Cli {
    /// Authentication token (64 lowercase hex characters).
    #[arg(long)]
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout belongs to JSON-RPC; logs go to stderr.
    imcp::logging::init_stderr();
    let cli = Cli::parse();

    let looks_like_secret =
        cli.token.len() == 64 && cli.token.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if !looks_like_secret {
        warn!("Token does not look like a 64-hex secret; the server will likely reject it");
    }

    let support_dir = imcp::config::support_dir();
    imcp::bridge::run(&cli.token, &support_dir).await
}
