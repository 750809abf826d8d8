//! Over-the-air bundle updates.
//!
//! A device checks the server for a newer patch, downloads it into a staging
//! generation, verifies and installs it on top of the running bundle, and can roll
//! back to the previous generation when the new bundle crashes the application.

pub mod archive;
pub mod codec;
pub mod config;
pub mod delta;
pub mod download;
pub mod error;
pub mod generation;
pub mod install;
pub mod manager;
pub mod patch_format;
pub mod publish;
pub mod remote;
pub mod rollback;
mod rolling_hash;
pub mod service;
pub mod util;

pub use config::Config;
pub use error::{ErrorKind, Result, UpdateError};
pub use generation::{ActiveGeneration, GenerationKind, GenerationStore};
pub use manager::{ManagerState, Status, UpdateManager};
pub use patch_format::PatchMeta;
pub use service::{Command, Host, HostEvent, UpdateService};
