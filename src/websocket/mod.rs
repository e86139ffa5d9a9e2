//! WebSocket Real-Time Broadcast
//!
//! Relays published messages to WebSocket clients by topic.
//!
//! ## Architecture
//!
//! - **Hub**: owns all connections and the exact-topic index; a single
//!   coordinator task applies every register, unregister and dispatch
//! - **Connection**: one session with a bounded delivery queue and its own
//!   read and write tasks
//! - **Handler**: HTTP upgrade entry point
//! - **Messages**: wire formats
//!
//! A connection whose delivery queue fills up is dropped rather than
//! waited on, so one slow client never stalls fan-out to the rest.
//!
//! ## Example
//!
//! ```javascript
//! const ws = new WebSocket('ws://localhost:8086/ws');
//!
//! ws.onopen = () => {
//!   ws.send(JSON.stringify({type: 'subscribe', channel: 'chat'}));
//! };
//!
//! ws.onmessage = (event) => {
//!   // Several messages may arrive in one frame, one JSON object per line
//!   for (const line of event.data.split('\n')) {
//!     console.log('Received:', JSON.parse(line));
//!   }
//! };
//! ```

mod connection;
mod handler;
mod hub;
mod messages;

pub use connection::{
    is_normal_close, read_pump, write_pump, Connection, ConnectionId, ConnectionState, Delivery,
    KeepaliveConfig,
};
pub use handler::websocket_handler;
pub use hub::{Coordinator, Hub, HubConfig, HubError};
pub use messages::{ClientMessage, Frame, Message, BROADCAST_TOPIC};

pub(crate) use hub::fan_out;
