//! # silo-common
//!
//! Shared types for the silo container runtime:
//! - the workspace error enum
//! - the place/volume/layer filesystem layout
//! - disk quantity parsing
//! - caller credentials

#![warn(missing_docs)]

pub mod cred;
pub mod error;
pub mod paths;
pub mod size;

pub use cred::Cred;
pub use error::{SiloError, SiloResult};
pub use paths::SiloPaths;
