//! # exsim
//!
//! Optimistic state synchronisation for collaborative exercise simulations.
//!
//! A server holds the authoritative exercise state. Clients propose actions,
//! may apply them tentatively while the server decides, and reconcile with
//! the server's commit order once it answers. Any client can step back
//! through the exercise by replaying its recorded history.
//!
//! ## Components
//!
//! - `exsim-protocol`: envelope format, codecs, messages and transport traits
//! - `exsim-simulation`: reducer contract, state store, optimistic coordinator and replay
//! - `exsim-client`: client event loop with memory and WebSocket transports
//! - `exsim-server`: authoritative server event loop with memory and WebSocket transports
//!
//! ## Example
//!
//! See `tests/` for complete client/server sessions over both transports.

pub use exsim_client as client;
pub use exsim_protocol as protocol;
pub use exsim_server as server;
pub use exsim_simulation as simulation;
