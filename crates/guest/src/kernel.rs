use std::sync::Arc;

use arena::Arena;
use types::{CpuId, TaskId, Trap, UserImageSpec};

use crate::error::ModuleError;
use crate::hypercalls::{HostFn, Hypercalls, NOSYS};

/// Imports handed to the kernel module at instantiation: the shared arena
/// and the hypercall table.
#[derive(Clone)]
pub struct KernelEnv {
    pub arena: Arena,
    pub hypercalls: Arc<dyn Hypercalls>,
}

fn arg_u32(args: &[i64], at: usize) -> u32 {
    args.get(at).copied().unwrap_or(0) as u32
}

fn arg_i32(args: &[i64], at: usize) -> i32 {
    args.get(at).copied().unwrap_or(0) as i32
}

impl KernelEnv {
    /// Resolves one declared function import by name.
    ///
    /// The `wasm_*` names bind to the hypercall table. Any other `sys_*`
    /// name is a syscall the kernel declares but does not define; those get
    /// a stub returning `-ENOSYS` that tolerates any argument list. All
    /// remaining names fail instantiation.
    pub fn resolve(&self, name: &str) -> Result<HostFn, ModuleError> {
        let hypercalls = self.hypercalls.clone();
        let bound: HostFn = match name {
            "wasm_start_cpu" => Arc::new(move |args| {
                hypercalls
                    .start_cpu(
                        CpuId(arg_u32(args, 0)),
                        TaskId(arg_u32(args, 1)),
                        arg_u32(args, 2),
                    )
                    .map(|_| 0)
            }),
            "wasm_stop_cpu" => Arc::new(move |args| {
                hypercalls.stop_cpu(CpuId(arg_u32(args, 0))).map(|_| 0)
            }),
            "wasm_create_and_run_task" => Arc::new(move |args| {
                let user = (arg_u32(args, 3) != 0).then(|| UserImageSpec {
                    bin_start: arg_u32(args, 3),
                    bin_end: arg_u32(args, 4),
                    data_start: arg_u32(args, 5),
                    table_start: arg_u32(args, 6),
                });
                hypercalls
                    .create_and_run_task(
                        TaskId(arg_u32(args, 0)),
                        TaskId(arg_u32(args, 1)),
                        arg_u32(args, 2),
                        user,
                    )
                    .map(|task| task.0 as i64)
            }),
            "wasm_release_task" => Arc::new(move |args| {
                hypercalls.release_task(TaskId(arg_u32(args, 0))).map(|_| 0)
            }),
            "wasm_serialize_tasks" => Arc::new(move |args| {
                hypercalls
                    .serialize_tasks(TaskId(arg_u32(args, 0)), TaskId(arg_u32(args, 1)))
                    .map(|task| task.0 as i64)
            }),
            "wasm_panic" => Arc::new(move |args| {
                hypercalls.panic(arg_u32(args, 0)).map(|_| 0)
            }),
            "wasm_dump_stacktrace" => Arc::new(move |args| {
                hypercalls
                    .dump_stacktrace(arg_u32(args, 0), arg_u32(args, 1))
                    .map(|_| 0)
            }),
            "wasm_load_executable" => Arc::new(move |args| {
                hypercalls
                    .load_executable(UserImageSpec {
                        bin_start: arg_u32(args, 0),
                        bin_end: arg_u32(args, 1),
                        data_start: arg_u32(args, 2),
                        table_start: arg_u32(args, 3),
                    })
                    .map(|_| 0)
            }),
            "wasm_user_mode_tail" => Arc::new(move |args| {
                hypercalls.user_mode_tail(arg_i32(args, 0)).map(|_| 0)
            }),
            "wasm_cpu_clock_get_monotonic" => Arc::new(move |_| {
                hypercalls.clock_monotonic().map(|ns| ns as i64)
            }),
            "wasm_driver_hvc_put" => Arc::new(move |args| {
                hypercalls
                    .console_put(arg_u32(args, 0), arg_u32(args, 1))
                    .map(|count| count as i64)
            }),
            "wasm_driver_hvc_get" => Arc::new(move |args| {
                hypercalls
                    .console_get(arg_u32(args, 0), arg_u32(args, 1))
                    .map(|count| count as i64)
            }),
            _ if name.starts_with("sys_") => Arc::new(|_| Ok(NOSYS)),
            _ => return Err(ModuleError::UnknownImport(name.to_string())),
        };
        Ok(bound)
    }
}

/// A precompiled guest kernel image. One image serves every worker thread;
/// each thread instantiates it against the same arena.
pub trait KernelImage: Send + Sync {
    /// Instantiates the image. The first instantiation on an arena performs
    /// the one-time static-data initialization (data copy, BSS clear),
    /// guarded by an in-arena atomic so later instantiations skip it.
    fn instantiate(&self, env: KernelEnv) -> Result<Arc<dyn KernelInstance>, ModuleError>;
}

/// Entry points and cells exported by an instantiated kernel module.
///
/// `boot`, `secondary` and `raise_exception` never return normally; a
/// normal return is a protocol violation the caller must treat as fatal.
pub trait KernelInstance: Send + Sync {
    /// `_start`: boot the machine. Primary CPU only.
    fn boot(&self) -> Result<(), Trap>;

    /// `_start_secondary`: enter the kernel on a secondary CPU.
    fn secondary(&self, start_stack: u32) -> Result<(), Trap>;

    /// `ret_from_fork`: finish a task switch into a freshly created task.
    /// Returns true when the task must run the user clone callback instead
    /// of the executable's entry point.
    fn ret_from_fork(&self, prev: TaskId, new: TaskId) -> Result<bool, Trap>;

    /// Syscall entry re-exported to user executables; stands for the
    /// per-argument-count trampolines of the kernel ABI.
    fn syscall(&self, nr: u32, args: [u32; 6]) -> Result<u32, Trap>;

    /// Stack pointer the current task's user code should run on.
    fn user_stack_pointer(&self) -> u32;

    /// TLS base the current task's user code should run with.
    fn user_tls_base(&self) -> u32;

    /// Arena address of the kernel's `init_task`, which doubles as the boot
    /// task's id.
    fn init_task(&self) -> TaskId;

    /// Arena address of the boot command-line buffer.
    fn boot_command_line(&self) -> u32;

    /// Arena address of the cell receiving the initrd start offset.
    fn initrd_start_cell(&self) -> u32;

    /// Arena address of the cell receiving the initrd end offset.
    fn initrd_end_cell(&self) -> u32;

    /// Dump kernel diagnostics after a host-detected crash.
    fn raise_exception(&self) -> Result<(), Trap>;
}
