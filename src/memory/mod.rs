//! # Memory Management
//!
//! Two layers of accounting keep queries inside their budgets:
//!
//! ```text
//! +--------------------------------------------------------+
//! |               MemoryTracker (process-wide)             |
//! |   atomic reserve/release, peak + failure counters      |
//! +--------------------------------------------------------+
//!       ▲ reserve              ▲ reserve
//! +---------------+      +---------------+
//! | QueryAllocator|      | QueryAllocator|   one per query
//! |  cap + arena  |      |  cap + arena  |
//! +---------------+      +---------------+
//!       │ bump                 │ bump
//! +---------------+      +---------------+
//! |  QueryArena   |      |  QueryArena   |   bulk-freed at teardown
//! +---------------+      +---------------+
//! ```
//!
//! An allocation proceeds only when both the query's own cap and the
//! global ceiling admit it; both are released on teardown. Enforcement is
//! hard — refusal, not degradation — which is the safe posture on
//! memory-constrained edge hardware.

mod allocator;
mod arena;
mod tracker;

pub use allocator::{MemoryBudgetExceeded, QueryAllocator};
pub use arena::QueryArena;
pub use tracker::{MemoryReservation, MemoryTracker};
