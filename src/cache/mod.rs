//! Daybook cache system.
//!
//! Keeps a reactive, in-memory mirror of query results and the optimistic
//! layers of in-flight mutations:
//!
//! - **Entity store**: one entry per [`QueryKey`], with freshness, in-flight
//!   fetch deduplication and garbage collection of unobserved entries
//! - **Notification bus**: per-subscriber channels fed with entry snapshots
//! - **Invalidation router**: mutation kind → key patterns to refetch
//!
//! ## Configuration
//!
//! Freshness and collection are controlled via `daybook.toml`:
//!
//! ```toml
//! [cache]
//! stale_time_seconds = 300
//! gc_delay_seconds = 300
//! gc_interval_seconds = 60
//! ```

mod config;
mod events;
mod keys;
pub(crate) mod lock;
mod router;
mod store;
mod value;

pub use config::CacheConfig;
pub use events::{Epoch, NotificationBus, SubscriberId, Subscription};
pub use keys::{KeyPattern, QueryKey, TaskScope};
pub use router::{InvalidationEvent, InvalidationPlan};
pub use store::{CacheEntry, EntityStore, FetchStatus};
pub use value::{CacheValue, Patch};
