// Typed ids and the error taxonomy
pub mod error;
pub mod ids;

// Configuration and logging setup
pub mod config;
pub mod telemetry;

// Exclusive leases on resource keys
pub mod lock;

// Streaming tool-call extraction
pub mod llm;
pub mod parser;

// Domain: locations, agents, gimmicks and their storage
pub mod agent;
pub mod gimmick;
pub mod location;
pub mod registry;
pub mod repository;

// Host-side runtime support
pub mod shutdown;
pub mod sweeper;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
