pub mod memory;
pub mod websocket;

// Re-export the ServerTransport trait from protocol
pub use exsim_protocol::ServerTransport;

/// Default transport type (WebSocket)
///
/// This is the recommended transport for most use cases.
pub type DefaultTransport = websocket::WebSocketServer;
