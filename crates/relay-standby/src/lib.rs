//! Relay Hot Standby
//!
//! Redis-based leader election so multiple router instances can run with
//! only one consuming queues. Acquisition uses `SET NX EX`; refresh and
//! release are Lua compare-and-set scripts keyed on the instance id.
//!
//! # Example
//!
//! ```no_run
//! use relay_standby::{LeaderElection, LeaderElectionConfig, StandbyGate};
//! use std::sync::Arc;
//!
//! async fn example() {
//!     let config = LeaderElectionConfig::new("redis://localhost:6379".to_string())
//!         .with_lock_key("my-router:leader".to_string());
//!
//!     let election = Arc::new(LeaderElection::new(config).await.unwrap());
//!     election.clone().start().await.unwrap();
//!
//!     let gate = StandbyGate::new(election);
//!     gate.wait_for_leadership().await;
//!     // start consumers
//! }
//! ```

mod error;
mod leader;

pub use error::{Result, StandbyError};
pub use leader::{LeaderElection, LeaderElectionConfig, LeadershipStatus, StandbyGate};
