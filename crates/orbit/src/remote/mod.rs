//! Remote-node subsystem: SSH transport pool, node registry, and the
//! per-node heartbeat engine.

pub mod heartbeat;
pub mod pool;
pub mod registry;

pub use heartbeat::{Engine, HeartbeatConfig, NodeEvent, NodeProber};
pub use pool::{gather_host_key, ExecOutput, Pool, Transport, TransportError};
pub use registry::Registry;
