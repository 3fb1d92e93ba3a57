//! # PocketSync Core
//!
//! Server-side synchronization state for PocketSync:
//!
//! - [`ChangeLog`]: append-only, per-collection sequence-numbered history
//!   with checkpoint-aware compaction
//! - [`ClientRegistry`]: live connection tracking with per-user caps and
//!   idle pruning
//! - [`SubscriptionRegistry`]: live-query state and the incremental delta
//!   computer
//! - [`DeltaBatcher`]: per-subscription batch windows with coalescing
//! - [`DocumentStore`]: the storage-engine seam, with an in-memory
//!   implementation for tests and demos
//! - [`ConflictResolver`]: the pluggable push conflict seam
//!
//! All shared structures use interior locking so that one handling context
//! per connection can call into them concurrently. Delta computation and
//! coalescing are pure and non-suspending; only the batch-window timers
//! touch the async runtime.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod batch;
mod changelog;
mod conflict;
mod error;
mod registry;
mod store;
mod subscription;

pub use batch::{DeltaBatcher, DeltaSink};
pub use changelog::ChangeLog;
pub use conflict::{ConflictResolver, LastWriteWins, Resolution};
pub use error::{CoreError, CoreResult};
pub use registry::{ClientRegistry, ClientSession};
pub use store::{DocumentStore, MemoryDocumentStore};
pub use subscription::{SubscriptionRegistry, SubscriptionState};
