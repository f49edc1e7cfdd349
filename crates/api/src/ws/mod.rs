//! WebSocket layer: browser clients receive every engine event as JSON.
//!
//! Provides connection management, the heartbeat, the bus-to-socket
//! forwarder and the HTTP upgrade handler.

mod forwarder;
mod handler;
mod heartbeat;
pub mod manager;

pub use forwarder::start_event_forwarder;
pub use handler::ws_handler;
pub use heartbeat::start_heartbeat;
pub use manager::WsManager;
