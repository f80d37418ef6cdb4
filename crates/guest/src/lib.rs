pub mod error;
pub use error::ModuleError;

pub mod global;
pub use global::GlobalCell;

pub mod hypercalls;
pub use hypercalls::{HostFn, Hypercalls, NOSYS};

pub mod kernel;
pub use kernel::{KernelEnv, KernelImage, KernelInstance};

pub mod user;
pub use user::{AbortHook, ModuleEngine, UserEnv, UserImage, UserInstance};
