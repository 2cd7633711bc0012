//! Header and protocol-version constants used by both streamable HTTP
//! transports (§4.3, §6).

pub const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
pub const HEADER_PROTOCOL_VERSION: &str = "MCP-Protocol-Version";
pub const HEADER_LAST_EVENT_ID: &str = "Last-Event-ID";

/// The protocol version assumed when a request omits
/// `MCP-Protocol-Version` entirely (§4.3 step 2: "missing defaults to the
/// designated previous version").
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

pub const MIME_JSON: &str = "application/json";
pub const MIME_EVENT_STREAM: &str = "text/event-stream";
