// Hotpatch Engine - Core module structure
pub mod cli;
pub mod config;
pub mod content;
pub mod coordinator;
pub mod diff;
pub mod error;
pub mod manifest;
pub mod updater;

pub use config::Config;
pub use coordinator::{Command, Coordinator, Outcome, Step, UpdateContext, UpdateEvent};
pub use error::{FailureCode, UpdateError};
pub use manifest::{ManifestAccessor, VersionedManifest};
