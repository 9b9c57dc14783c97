//! Hotpatch - incremental content patches for installed clients
//!
//! Build side: [`engine::diff`] computes the changed bundles between two
//! manifest snapshots and packages them into a versioned patch artifact.
//!
//! Runtime side: [`engine::coordinator`] fetches update info, downloads,
//! verifies and extracts the patch, then reloads content and loads modules.

pub mod engine;
