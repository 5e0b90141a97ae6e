//! # rjunos - Junos Session and Transaction Orchestration
//!
//! `rjunos` drives Junos devices over NETCONF. It owns the lifecycle of a
//! device connection and of the configuration database session opened on
//! it, dispatches arbitrary RPCs with per-RPC formats and arguments, runs
//! configuration transactions, and copies files with checksum verification.
//!
//! ## Features
//!
//! - **Configuration Sessions**: exclusive, private, dynamic, batch and ephemeral modes with guaranteed release
//! - **RPC Dispatch**: batches of RPCs with broadcast or per-RPC formats, kwargs and attributes
//! - **Transactions**: load, check, diff, commit and rollback with warning suppression
//! - **Verified Transfers**: SCP/FTP put and get that skip identical files and verify the result
//! - **Delegated Sessions**: the same operations forwarded to a session broker over a Unix socket
//! - **Maximum Compatibility**: wide SSH algorithm support for older devices
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rjunos::options::{ConfigMode, LoadAction};
//! use rjunos::session::{
//!     CommitOptions, ConfigChange, ConfigRequest, ConnectionManager, ConnectionParams,
//!     LoadRequest,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let params = ConnectionParams::new("192.168.1.1", "admin").with_password("secret");
//!     let mut manager = ConnectionManager::new(params);
//!
//!     let change = ConfigChange::new("disable-ge0", ConfigRequest::new(ConfigMode::Exclusive))
//!         .with_load(LoadRequest::lines(
//!             LoadAction::Merge,
//!             ["set interfaces ge-0/0/0 disable"],
//!         ))
//!         .with_commit(CommitOptions::default());
//!
//!     let summary = manager.apply_change(&change, None).await;
//!     let summary = manager.finish(summary).await?;
//!     println!("changed: {}, committed: {}", summary.changed, summary.committed);
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`session::ConnectionManager`] - connection, configuration session, RPCs, transfers and reboot
//! - [`backend::SessionBackend`] - direct NETCONF or delegated broker execution
//! - [`transport`] - NETCONF over SSH or telnet, SCP and FTP, plus a scripted device for tests
//! - [`error::DeviceError`] - error type for every operation
//! - [`config`] - SSH algorithm tables and protocol constants

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod options;
pub mod output;
pub mod session;
pub mod transport;
pub mod xml;
