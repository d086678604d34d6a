//! Signaling for session establishment.
//!
//! - `message`: inbound/outbound message model and channel descriptor
//! - `callback`: closure callbacks the transport invokes
//! - `transport`: transport trait and the shared outbound send path
//! - `ws_client`: WebSocket transport with HTTP channel descriptor fetch

pub mod callback;
pub mod message;
pub mod transport;
pub mod ws_client;

pub use callback::*;
pub use message::*;
pub use transport::*;
pub use ws_client::*;
