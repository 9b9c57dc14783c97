//! Hot Patch Updater
//!
//! Runtime building blocks driven by the update coordinator.
//!
//! Components:
//! - `remote` - Update info request and the update decision
//! - `download` - Streamed HTTP download with progress
//! - `verify` - MD5 / SHA-256 archive verification
//! - `extract` - Archive extraction on a background worker
//! - `state` - Persisted local version and session module registry
//! - `layout` - On-device directory layout

pub mod download;
pub mod extract;
pub mod layout;
pub mod remote;
pub mod state;
pub mod verify;

pub use download::{DownloadError, DownloadOptions, Downloader, Progress};
pub use extract::{extract_archive, ExtractError, ExtractJob, ExtractReport};
pub use layout::{LayoutError, SandboxLayout};
pub use remote::{decide, BuildIdentity, InfoError, RemoteUpdateInfo, UpdateDecision, VersionResolver};
pub use state::{LocalUpdateState, ModuleSlot, StateError};
pub use verify::{ArchiveVerifier, DigestAlgorithm, PublishedDigest, VerifyError};
