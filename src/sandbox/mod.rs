//! Sandbox module - Scopes and isolation backends
//!
//! This module provides the low-level pieces every sandboxed process needs:
//! - Per-invocation scratch directories with guaranteed removal
//! - Isolation backend detection (bubblewrap / namespaces / none)
//! - Configuration for limits and the child environment
//!
//! The sandbox module does NOT:
//! - Spawn or supervise processes (that's the runner's job)
//! - Know about languages or compilation
//! - Compare outputs

pub mod config;
pub mod isolation;
pub mod scope;

// Re-exports for convenience
pub use config::SandboxConfig;
pub use isolation::{
    is_bubblewrap_available, is_unshare_available, resolve_isolation, Isolation, IsolationMode,
};
pub use scope::{Scope, ScopeManager};
