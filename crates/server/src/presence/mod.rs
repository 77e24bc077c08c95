pub mod awareness;
pub mod identity;
pub mod timers;

pub use awareness::{AwarenessStore, SweptLock, UpsertOutcome};
pub use identity::{CachedIdentity, IdentityCache};
pub use timers::TimerRegistry;
