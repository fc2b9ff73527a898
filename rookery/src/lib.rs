//! # Rookery
//!
//! A service broker for building microservice meshes: a soft-state
//! service registry kept in sync over a gossip-style packet protocol,
//! load-balanced action calls, balanced and broadcast events, and a
//! fault-tolerance pipeline (timeouts, retries, circuit breakers,
//! bulkheads, fallbacks, caching) wrapped around every call.
//!
//! Every broker is one node. Brokers discover each other through a
//! pluggable [`Transport`](transport::Transport), announce their services
//! in INFO packets and keep liveness with heartbeats; calls to an action
//! served by several nodes are spread by a configurable
//! [strategy](strategy::StrategyKind). There is no global broker
//! instance: tests routinely run a whole mesh inside one process on the
//! in-memory transport.
//!
//! ```no_run
//! use rookery::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), BrokerError> {
//!     let broker = Broker::builder()
//!         .service(
//!             ServiceSpec::builder("math")
//!                 .action(ActionSpec::new("add", |ctx| async move {
//!                     let a = ctx.params()["a"].as_i64().unwrap_or(0);
//!                     let b = ctx.params()["b"].as_i64().unwrap_or(0);
//!                     Ok(json!(a + b))
//!                 }))
//!                 .build(),
//!         )
//!         .build()?;
//!
//!     tokio::task::LocalSet::new()
//!         .run_until(async {
//!             broker.start().await?;
//!             let sum = broker.call("math.add", json!({ "a": 1, "b": 2 })).await?;
//!             assert_eq!(sum, json!(3));
//!             broker.stop().await
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! The broker runs on a current-thread Tokio runtime: state is shared
//! with `Rc`/`RefCell`, handlers and the pluggable seams
//! ([`Transport`](transport::Transport),
//! [`Serializer`](serializer::Serializer), [`Cacher`](cacher::Cacher))
//! need not be `Send`. Anything that spawns (a started broker with a
//! transport) must live inside a [`tokio::task::LocalSet`].

#![deny(clippy::unwrap_used)]

pub mod broker;
pub mod bus;
pub mod cacher;
pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod prelude;
pub mod registry;
pub mod serializer;
pub mod service;
pub mod strategy;
pub mod transit;
pub mod transport;

pub use broker::{Broker, BrokerBuilder, BrokerState, PongInfo};
pub use bus::{BrokerEvent, NotificationBus};
pub use cacher::{CachePolicy, Cacher, MemoryCacher};
pub use config::{BrokerOptions, BulkheadConfig, CircuitBreakerConfig, RetryPolicy};
pub use context::{CallOptions, Context};
pub use error::{BrokerError, WireError};
pub use pipeline::circuit_breaker::BreakerState;
pub use registry::{Node, NodeId};
pub use serializer::{JsonSerializer, Serializer, SerializerError};
pub use service::{ActionSpec, EventSpec, ServiceBuilder, ServiceSpec};
pub use strategy::StrategyKind;
pub use transport::{MemoryHub, MemoryTransport, Transport, TransportError};
