//! Oxnode: an embedded Bitcoin block storage and validation engine.
//!
//! [`Node`] ties the chain state and the mempool together behind one lock
//! and exposes the query surface consumed by wallets and other local
//! clients. Chain tip changes and accepted transactions are published to
//! subscribers as [`NodeEvent`]s.

#![allow(clippy::result_large_err)]

pub mod cli;
mod commands;
mod config;
mod error;
mod events;
mod import;
mod maintenance;
mod node;
mod resources;

pub use self::config::{DEFAULT_CHECK_BLOCKS, DEFAULT_MAX_TIP_AGE, NodeConfig};
pub use self::error::{Error, Result, StartupError};
pub use self::events::NodeEvent;
pub use self::import::ImportStats;
pub use self::maintenance::{MaintenanceConfig, spawn_maintenance};
pub use self::node::{BlockIndexInfo, BlockRef, ConfirmedIn, Node, NodeState, TransactionInfo};
pub use self::resources::{DEFAULT_MIN_FILE_DESCRIPTORS, DEFAULT_MIN_FREE_DISK_SPACE, Resource};
pub use oxnode_chain::ImportStatus;
pub use oxnode_mempool::{FeeRate, MempoolError, MempoolInfo};
