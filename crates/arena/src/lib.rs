pub mod arena;
pub use arena::{Arena, ArenaError, GROWTH_UNIT};

pub mod sync;
pub use sync::{HandoffLock, LastTask, Messenger};
