//! OFS Sim - seeded fault-injection simulator for the offline sync core
//!
//! Provides:
//! - [`SimulatorConfig`]: seed, step count and fault rates
//! - [`run_simulator`]: random edits against an unreliable in-memory remote
//! - [`SimulatorReport`]: stats plus every lost or resurrected entity
//!
//! # Example
//!
//! ```rust,ignore
//! use ofs_sim::{run_simulator, simulation_sync_config, SimulatorConfig};
//!
//! let report = run_simulator(SimulatorConfig::default(), simulation_sync_config()).await?;
//! assert!(report.passed(), "{}", report.generate_text());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod simulator;

pub use simulator::{
    run_simulator, simulation_sync_config, SimulatedOperation, SimulatorConfig, SimulatorReport,
    SimulatorStats, Violation,
};

/// Version of the simulator crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
