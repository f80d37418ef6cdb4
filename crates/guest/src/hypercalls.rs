use std::sync::Arc;

use types::{CpuId, TaskId, Trap, UserImageSpec};

/// Return value of the stub bound to unimplemented syscall imports
/// (`-ENOSYS`).
pub const NOSYS: i64 = -38;

/// An import resolved down to a plain callable. Short argument lists read
/// as zeroes, so arity mismatches in stubbed imports stay harmless.
pub type HostFn = Arc<dyn Fn(&[i64]) -> Result<i64, Trap> + Send + Sync>;

/// The host functions the guest kernel imports. This table is the kernel's
/// only way of affecting the world outside the arena.
///
/// Every call returns `Result<_, Trap>` so kernel code propagates
/// discontinuities with `?`. The blocking calls (`create_and_run_task`,
/// `serialize_tasks`, `console_get`) park the calling thread and resolve a
/// shutdown request into `Err(Trap::Shutdown)`.
pub trait Hypercalls: Send + Sync {
    /// `wasm_start_cpu`: bring up a secondary CPU. Thread creation is the
    /// orchestrator's job, so this only posts a request and never blocks.
    fn start_cpu(&self, cpu: CpuId, idle_task: TaskId, start_stack: u32) -> Result<(), Trap>;

    /// `wasm_stop_cpu`: stop a secondary CPU, rather abruptly.
    fn stop_cpu(&self, cpu: CpuId) -> Result<(), Trap>;

    /// `wasm_create_and_run_task`: register `new` on a fresh thread and run
    /// it, parking the caller. Returns the task that eventually switched
    /// back to the caller. `user` is set when the new task duplicates a user
    /// executable (clone).
    fn create_and_run_task(
        &self,
        prev: TaskId,
        new: TaskId,
        name: u32,
        user: Option<UserImageSpec>,
    ) -> Result<TaskId, Trap>;

    /// `wasm_release_task`: drop a task created by `create_and_run_task`.
    fn release_task(&self, dead: TaskId) -> Result<(), Trap>;

    /// `wasm_serialize_tasks`: hand execution to `next`, park the caller,
    /// and return the task that later switched back to the caller.
    fn serialize_tasks(&self, prev: TaskId, next: TaskId) -> Result<TaskId, Trap>;

    /// `wasm_panic`: report the NUL-terminated panic message. Always comes
    /// back as `Err(Trap::Panic)`.
    fn panic(&self, msg: u32) -> Result<(), Trap>;

    /// `wasm_dump_stacktrace`: write a NUL-terminated host stack snapshot at
    /// `buf`, truncated to `max_size`. The format is implementation-defined.
    fn dump_stacktrace(&self, buf: u32, max_size: u32) -> Result<(), Trap>;

    /// `wasm_load_executable`: compile the image described by `spec` out of
    /// the arena and stage it. Takes effect at the next user setup.
    fn load_executable(&self, spec: UserImageSpec) -> Result<(), Trap>;

    /// `wasm_user_mode_tail`: act on a user-mode return that should not
    /// proceed normally. Not called on normal returns.
    fn user_mode_tail(&self, flow: i32) -> Result<(), Trap>;

    /// `wasm_cpu_clock_get_monotonic`: nanoseconds since an arbitrary
    /// anchor, at microsecond resolution.
    fn clock_monotonic(&self) -> Result<u64, Trap>;

    /// `wasm_driver_hvc_put`: buffered console write. Never blocks; always
    /// reports the full count as transferred.
    fn console_put(&self, buf: u32, count: u32) -> Result<u32, Trap>;

    /// `wasm_driver_hvc_get`: console read. Parks until the orchestrator
    /// replies with the transferred byte count, which may be 0.
    fn console_get(&self, buf: u32, count: u32) -> Result<u32, Trap>;
}
