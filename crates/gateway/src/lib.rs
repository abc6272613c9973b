//! Remote browser-streaming gateway.
//!
//! Per authenticated client: one headless browser, one page, one CDP channel.
//! Screencast frames stream out over the client WebSocket under backpressure;
//! input commands flow back in. The session control plane keeps the whole
//! thing alive across browser crashes, dead CDP channels, and memory
//! pressure without letting one client disturb another.

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod fabric;
pub mod health;
pub mod memory;
pub mod pump;
pub mod router;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::{FabricConfig, SessionSettings};
pub use error::GatewayError;
pub use fabric::{CircuitBreaker, FabricError, RetryPolicy};
pub use memory::{MemoryGovernor, MemoryPressure, PressureLevel};
pub use router::MessageRouter;
pub use server::AppState;
pub use session::{Session, SessionManager};
