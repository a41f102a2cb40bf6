//! iMCP — a localhost-only MCP gateway for host capabilities.
//!
//! The daemon (`imcpd`) exposes a fixed catalog of host services
//! (calendar, reminders, contacts, messages) to AI assistant clients over
//! the Model Context Protocol: newline-delimited JSON-RPC 2.0 on a
//! loopback TCP port, behind a per-connection token handshake. Assistant
//! clients launch the companion `imcp-server` binary, which bridges their
//! stdio to that port.
//!
//! Architecture:
//! - `server`   -- listener, auth gate, sessions, change broadcaster
//! - `registry` -- tool catalog and permission-gated dispatcher
//! - `services` -- host service adapters
//! - `bridge`   -- the stdio<->TCP proxy
//! - `watcher`  -- message database watcher
//! - `settings` -- token/service snapshots written by the UI layer

pub mod bridge;
pub mod config;
pub mod logging;
pub mod mcp;
pub mod registry;
pub mod server;
pub mod services;
pub mod settings;
pub mod tokens;
pub mod watcher;
