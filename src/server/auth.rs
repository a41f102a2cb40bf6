//! Connection authentication gate.
//!
//! A freshly accepted socket must send one line — the 64-hex token secret —
//! before any JSON-RPC byte. The gate reads that line with a hard size cap
//! and timeout, then compares it against every token in the current
//! snapshot in constant time. No match means the socket is closed without
//! the server ever writing a byte.

use std::time::Duration;

use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;

use crate::tokens::{Token, TokenSnapshot};

/// Maximum bytes accepted before a newline must appear.
pub const MAX_TOKEN_LINE: usize = 256;

/// How long the gate waits for the token line.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Constant-time byte comparison.
///
/// Unequal lengths fail, but only after XOR-accumulating over the shorter
/// input so runtime does not reveal where the first mismatch sits.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let n = a.len().min(b.len());
    let mut acc: u8 = 0;
    for i in 0..n {
        acc |= a[i] ^ b[i];
    }
    acc == 0 && a.len() == b.len()
}

/// Read the token line: bytes up to the first `\n`, capped at
/// [`MAX_TOKEN_LINE`]. Returns `None` on EOF or when the cap is exceeded.
pub async fn read_token_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(None);
        }
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            line.extend_from_slice(&buf[..pos]);
            reader.consume(pos + 1);
            if line.len() > MAX_TOKEN_LINE {
                return Ok(None);
            }
            return Ok(Some(line));
        }
        line.extend_from_slice(buf);
        let consumed = buf.len();
        reader.consume(consumed);
        if line.len() > MAX_TOKEN_LINE {
            return Ok(None);
        }
    }
}

/// Match a received line against the token snapshot.
///
/// The line is trimmed of surrounding whitespace; every candidate is
/// compared with [`constant_time_eq`]. Returns the matched token.
pub fn match_token(snapshot: &TokenSnapshot, line: &[u8]) -> Option<Token> {
    let trimmed = trim_ascii(line);
    let mut matched = None;
    for token in &snapshot.tokens {
        if constant_time_eq(token.secret.as_bytes(), trimmed) && matched.is_none() {
            matched = Some(token.clone());
        }
    }
    matched
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_constant_time_eq_basic() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(!constant_time_eq(b"", b"a"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_trim_ascii() {
        assert_eq!(trim_ascii(b"  token \r"), b"token");
        assert_eq!(trim_ascii(b"token"), b"token");
        assert_eq!(trim_ascii(b" \t "), b"");
    }

    #[tokio::test]
    async fn test_read_token_line_plain() {
        let mut reader = BufReader::new(&b"deadbeef\n{\"jsonrpc\":\"2.0\"}"[..]);
        let line = read_token_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(line, b"deadbeef");

        // The remainder of the stream is untouched.
        let mut rest = String::new();
        reader.read_line(&mut rest).await.unwrap();
        assert_eq!(rest, "{\"jsonrpc\":\"2.0\"}");
    }

    #[tokio::test]
    async fn test_read_token_line_eof_without_newline() {
        let mut reader = BufReader::new(&b"deadbeef"[..]);
        assert!(read_token_line(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_token_line_over_cap() {
        let long = vec![b'a'; MAX_TOKEN_LINE + 10];
        let mut input = long.clone();
        input.push(b'\n');
        let mut reader = BufReader::new(&input[..]);
        assert!(read_token_line(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_token_line_exact_cap() {
        let mut input = vec![b'a'; MAX_TOKEN_LINE];
        input.push(b'\n');
        let mut reader = BufReader::new(&input[..]);
        let line = read_token_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(line.len(), MAX_TOKEN_LINE);
    }

    #[test]
    fn test_match_token() {
        let token = Token::generate("Claude");
        let secret = token.secret.clone();
        let snapshot = TokenSnapshot {
            tokens: vec![token],
        };

        let matched = match_token(&snapshot, format!("  {}\r", secret).as_bytes());
        assert_eq!(matched.unwrap().name, "Claude");

        assert!(match_token(&snapshot, b"0000").is_none());
        assert!(match_token(&snapshot, secret[..63].as_bytes()).is_none());
    }

    #[test]
    fn test_match_token_empty_snapshot() {
        let snapshot = TokenSnapshot::default();
        assert!(match_token(&snapshot, b"anything").is_none());
    }
}
