//! One-line import for the common surface.
//!
//! ```
//! use rookery::prelude::*;
//! ```

pub use crate::broker::{Broker, BrokerState, PongInfo};
pub use crate::bus::BrokerEvent;
pub use crate::cacher::{CachePolicy, MemoryCacher};
pub use crate::config::{BrokerOptions, BulkheadConfig, CircuitBreakerConfig, RetryPolicy};
pub use crate::context::{CallOptions, Context};
pub use crate::error::BrokerError;
pub use crate::registry::NodeId;
pub use crate::service::{ActionSpec, EventSpec, ServiceSpec};
pub use crate::strategy::StrategyKind;
pub use crate::transport::{MemoryHub, MemoryTransport};
