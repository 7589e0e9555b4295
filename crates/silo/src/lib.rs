//! # silo core
//!
//! The isolation core of the silo container runtime daemon:
//!
//! - **Cgroup manager** — discovers controller hierarchies, builds the
//!   node-per-cgroup tree, attaches processes, freezes and kills, and
//!   dismantles cgroups on teardown.
//! - **Volume manager** — provisions, mounts, resizes and destroys
//!   storage volumes through pluggable backends, enforces quota
//!   guarantees across volumes sharing a device, and persists volume
//!   state across daemon restarts.
//!
//! The RPC surface, client CLI and per-container process supervision
//! live elsewhere and talk to this crate through narrow interfaces
//! ([`volume::ContainerRegistry`] being the main one).

#![warn(missing_docs)]

pub mod cgroup;
pub mod config;
pub mod filesystem;
pub mod volume;

pub use config::Config;
