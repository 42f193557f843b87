//! # lumen-node
//!
//! The ledger node daemon around `lumen-core`: configuration, component
//! wiring, the exhaustive message dispatcher, the JSON-RPC front-end and
//! genesis bootstrap. The binary (`lumend`) lives in `main.rs` and is a
//! thin shell over this crate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dispatch;
pub mod genesis;
pub mod roster;
pub mod rpc;
