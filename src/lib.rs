//! Client-library core for the Accord chat platform.
//!
//! Two coupled surfaces: the REST API behind [`http::Http`], dispatched
//! through per-bucket rate limiting, and the event gateway behind
//! [`gateway::GatewaySession`], a WebSocket session engine with heartbeat,
//! resume, and reconnect handling.

pub mod cache;
pub mod error;
pub mod events;
pub mod gateway;
pub mod http;
pub mod intents;
pub mod tri;

pub use error::Error;
pub use error::Result;
pub use intents::Intents;
