use std::sync::Arc;

use arena::Arena;
use types::Trap;

use crate::error::ModuleError;
use crate::global::GlobalCell;
use crate::kernel::KernelInstance;

/// Hook bound to the user executable's `__wasm_abort` import. Returns the
/// trap the aborting call stack unwinds with.
pub type AbortHook = Arc<dyn Fn() -> Trap + Send + Sync>;

/// Compiles user executables out of raw bytes. The engine is a collaborator
/// supplied at boot; the runtime never interprets the bytes itself.
pub trait ModuleEngine: Send + Sync {
    fn compile(&self, code: &[u8]) -> Result<Arc<dyn UserImage>, ModuleError>;
}

/// A compiled user executable, ready to instantiate once per run.
pub trait UserImage: Send + Sync {
    fn instantiate(&self, env: UserEnv) -> Result<Arc<dyn UserInstance>, ModuleError>;
}

/// Imports handed to a user executable at instantiation.
#[derive(Clone)]
pub struct UserEnv {
    pub arena: Arena,
    /// `__memory_base`: where the image's data segments were placed.
    pub memory_base: u32,
    /// `__table_base`: where the image's table segments were placed.
    pub table_base: u32,
    /// `__stack_pointer`: host-owned mutable global. The runtime rewrites it
    /// when setting up and tearing down signal frames.
    pub stack_pointer: Arc<GlobalCell>,
    /// Kernel instance providing the re-exported syscall trampolines.
    pub kernel: Arc<dyn KernelInstance>,
    /// `__wasm_abort`.
    pub abort: AbortHook,
}

/// Exports of an instantiated user executable.
///
/// `start`, `clone_callback` and `handle_signal` never return normally;
/// they leave through a syscall that traps. The optional entries return
/// `None` when the executable does not export them.
pub trait UserInstance: Send + Sync {
    /// `_start`. Required.
    fn start(&self) -> Result<(), Trap>;

    /// `__libc_clone_callback`, the entry of a clone()d child.
    fn clone_callback(&self) -> Option<Result<(), Trap>> {
        None
    }

    /// `__libc_handle_signal`.
    fn handle_signal(&self) -> Option<Result<(), Trap>> {
        None
    }

    /// `__wasm_apply_data_relocs`: fix up relocated data after
    /// instantiation.
    fn apply_data_relocs(&self) {}

    /// `__wasm_call_ctors`, skipped when the executable does not export it.
    fn call_ctors(&self) {}

    /// `__set_tls_base`.
    fn set_tls_base(&self, tls: u32);
}
