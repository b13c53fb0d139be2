//! JSON-RPC 2.0 stdio client for tool-server child processes.
//!
//! A tool server is a child process speaking line-delimited JSON-RPC on its
//! stdio: an `initialize` handshake, `tools/list`, `tools/call`, and optional
//! server→client notifications (`notifications/tool_progress`) that surface
//! as streaming output while a call is in flight.

mod protocol;
mod transport;

pub use protocol::{ToolDescriptor, PROTOCOL_VERSION};
pub use transport::{NotificationHandler, ToolTransport, TransportError};
