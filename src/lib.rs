//! # Vacuum System Supervisor
//!
//! Supervisory control core for a sputter deposition vacuum system: a relay
//! and sensor I/O board on a half-duplex serial link, a declarative safety
//! rule engine, and a cancellable procedure orchestrator.
//!
//! ## Features
//!
//! - **Device link**: single-owner command queue over the board's
//!   newline-framed text protocol, with polling, reconnect and a published
//!   state snapshot
//! - **Rule engine**: forbidden/required/threshold/emergency rules compiled
//!   from a YAML document, evaluated as pure functions of one snapshot
//! - **State detection**: named plant states (vented, rough vacuum, high
//!   vacuum, sputter) by priority-ordered predicates
//! - **Procedures**: pump down, vent, load/unload and sputter entry as
//!   step lists with per-slot exclusion, confirmation parking and rollback
//! - **Firmware contract**: the board's own interlock on the mains output,
//!   modeled in-process for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vacbus::config::default_config;
//! use vacbus::gas::NullGas;
//! use vacbus::link::{DeviceLink, LinkSettings, TcpConnector};
//! use vacbus::procedure::OrchestratorSettings;
//! use vacbus::supervisor::Supervisor;
//!
//! # async fn demo() {
//! let config = default_config().unwrap();
//! let connector = TcpConnector::new(&config.board.address);
//! let link = DeviceLink::spawn(connector, &config, LinkSettings::default());
//! let (supervisor, mut emergencies) =
//!     Supervisor::new(&config, link, Arc::new(NullGas), OrchestratorSettings::default());
//!
//! let mut run = supervisor.start_procedure("pump_down").unwrap();
//! let status = run.wait().await;
//! println!("pump_down: {:?}, state {}", status, supervisor.detected_state());
//! # let _ = emergencies.recv().await;
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`link`] - device link task, wire codec and transports
//! - [`rules`] - rule engine and system-state detector
//! - [`procedure`] - procedure orchestrator
//! - [`supervisor`] - console-facing facade
//! - [`config`] - declarative YAML document
//! - [`firmware`] - board firmware contract and its test model

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod config;
pub mod error;
pub mod expr;
pub mod firmware;
pub mod gas;
pub mod link;
pub mod procedure;
pub mod rules;
pub mod supervisor;

// Re-export main public types for convenience
pub use channel::StateSnapshot;
pub use config::SystemConfig;
pub use link::DeviceLink;
pub use procedure::{Orchestrator, RunHandle, RunStatus};
pub use rules::{Decision, EnforcementMode, RuleEngine};
pub use supervisor::Supervisor;
