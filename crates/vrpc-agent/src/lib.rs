//! # VRPC Agent
//!
//! Agent-side runtime for the VRPC system: register classes, connect to a
//! message broker and serve their constructors, methods and events to remote
//! clients.
//!
//! ```no_run
//! use vrpc_agent::{AgentOptions, ClassBuilder, Ret, VrpcAgent};
//! use serde_json::json;
//!
//! struct Greeter;
//!
//! # async fn run() -> Result<(), vrpc_agent::AgentError> {
//! let class = ClassBuilder::<Greeter>::new("Greeter")
//!     .constructor(|_| Ok(Greeter))
//!     .member("greet", |_obj, args| {
//!         let name = args.value(0).and_then(|v| v.as_str().map(String::from));
//!         Ok(Ret::Value(json!(format!("Hello, {}!", name.unwrap_or_default()))))
//!     })
//!     .build();
//!
//! let options = AgentOptions::new("public.vrpc", "greeting-agent")?
//!     .with_broker("mqtt://localhost:1883");
//! let mut agent = VrpcAgent::new(options);
//! agent.register(class);
//! agent.serve().await
//! # }
//! ```

#![warn(missing_docs)]

/// Class registry and RPC dispatch
pub mod adapter;

/// Broker session lifecycle and message routing
pub mod agent;

/// Broker abstraction and MQTT binding
pub mod broker;

/// Class descriptors, call arguments and callback plumbing
pub mod class;

/// Agent configuration surface
pub mod config;

/// Error types for agent operations
pub mod error;

/// Per-client instance tracking
pub mod tracker;

pub use adapter::Adapter;
pub use agent::{AgentEvent, AgentHandle, EndOptions, SessionStatus, VrpcAgent};
pub use broker::Broker;
pub use class::{Callback, CallArgs, ClassBuilder, ClassDescriptor, EventHub, Ret};
pub use config::{AgentOptions, Auth};
pub use error::AgentError;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;
