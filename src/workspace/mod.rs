//! Disk-first resources owned by a single conversion.
//!
//! ```text
//! input stream ──► materialize ──► <root>/src-XXXX/<file>   (owned, or borrowed path)
//!                                        │
//!                        converter + middleware read it
//!                                        │
//! artifacts    ──► ArtifactWorkspace ──► <root>/<uuid>/...  (+ storage mirror)
//! ```
//!
//! Every owned directory here is released exactly once on every exit path:
//! explicitly via `release`/`dispose`, or by `Drop` as a last resort.

pub mod artifacts;
pub mod materialize;
pub mod storage;

pub use artifacts::{ArtifactWorkspace, PersistedArtifact, WorkspaceSummary};
pub use materialize::{open_shared, MaterializedSource, Materializer};
pub use storage::{ArtifactStorage, FileSystemStorage, MemoryStorage, SharedStorage, StorageError};
