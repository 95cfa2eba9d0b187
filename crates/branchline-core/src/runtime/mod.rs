//! Live streaming state shared by request handlers.

pub mod accumulator;
pub mod coordinator;
pub mod startup;
pub mod steer;
pub mod stream_registry;
pub mod warm_pool;

pub use accumulator::{ContentAccumulator, STOP_MARKER};
pub use coordinator::{PreparedStream, StreamCoordinator, StreamEnd, StreamOutcome, StreamRequest};
pub use startup::StartupParams;
pub use steer::{SteerChannel, SteerContext};
pub use stream_registry::{StreamHandle, StreamSessionRegistry};
pub use warm_pool::{AgentWarmPool, WarmPoolStats};
