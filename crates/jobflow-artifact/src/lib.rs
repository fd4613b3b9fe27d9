//! jobflow artifacts
//!
//! Named, scoped pieces of data that tasks read and write.
//!
//! # Core Concepts
//!
//! - [`DataArtifact`]: immutable handle (id, scope, validity period)
//! - [`ArtifactMetadata`]: mutable write state owned by a store
//! - [`ArtifactStore`]: storage contract consumed by the orchestrator
//! - [`InMemoryArtifactStore`]: reference store for tests and embedding
//!
//! # Example
//!
//! ```rust
//! use jobflow_artifact::{ArtifactStore, DataArtifact, InMemoryArtifactStore, Scope};
//!
//! let store = InMemoryArtifactStore::new();
//! let foo = DataArtifact::new("foo", Scope::Scenario);
//!
//! assert!(!store.is_ready(&foo));
//! store.write(&foo, serde_json::json!(1), None).unwrap();
//! assert!(store.is_ready(&foo));
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod artifact;
mod store;

pub use artifact::{ArtifactId, ArtifactMetadata, DataArtifact, Scope};
pub use store::{ArtifactStore, InMemoryArtifactStore, StoreError};

/// Values carried by artifacts
pub use serde_json::Value;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
