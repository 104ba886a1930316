//! Concurrency limiters
//!
//! Two independent bounds gate every job:
//! - [`ResourcePool`]: system-wide ceiling per [`ResourceClass`](crate::types::ResourceClass),
//!   acquired by suspending until a permit frees up
//! - [`UserSlots`]: per-user ceiling across all classes, acquired without
//!   waiting (a user at their ceiling is told so immediately)
//!
//! Both hand out RAII guards, so a slot is released exactly once on every exit
//! path including panics, timeouts and cancellation. Admission always takes the
//! user slot first and the resource permit second.

mod resource_pool;
mod user_slots;

pub use resource_pool::{PoolUsage, ResourcePermit, ResourcePool};
pub use user_slots::{UserSlot, UserSlots};
