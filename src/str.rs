//! String helpers.
//!
//! Precomputed evaluation reasons share their string payloads, so they want a
//! representation whose clone is a refcount bump rather than an allocation.

use std::sync::Arc;

/// A string that can be cloned cheaply.
pub type ArcStr = Arc<str>;
