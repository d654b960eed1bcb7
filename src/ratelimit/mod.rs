//! Rate limiting logic and state management.

mod backend;
mod clock;
mod descriptor;
mod distributed;
mod limiter;
mod memory;
mod rules;

pub use backend::{Store, StoreStats, StoreType, WindowStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use descriptor::{RateKey, KEY_PREFIX};
pub use distributed::{RedisOptions, RedisStore};
pub use limiter::{Decision, RateLimiter};
pub use memory::MemoryStore;
pub use rules::{EndpointClass, Limit, PolicyTable, Tier};
