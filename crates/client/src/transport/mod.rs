pub mod memory;
pub mod websocket;

// Re-export the Transport trait from protocol
pub use exsim_protocol::Transport;

/// Default transport type (WebSocket)
pub type DefaultTransport = websocket::WebSocketClient;
