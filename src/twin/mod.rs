//! Twin module: authoritative twin documents
//!
//! Provides:
//! - Versioned twin documents with independent reported/desired sections
//! - A merge engine with null-delete semantics at every depth
//! - A store with per-device single-writer locking and push fan-out
//!
//! # Versioning
//!
//! Every accepted patch bumps its section's version by exactly one, even
//! when the content is unchanged. Desired patches may carry an expected
//! version (`*` to skip the check) and are rejected on mismatch.

pub mod merge;
mod store;
mod types;

pub use store::{Subscription, TwinStore};
pub use types::{DesiredPush, ExpectedVersion, Patch, Properties, Section, Twin};
