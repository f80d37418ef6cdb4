use std::backtrace::Backtrace;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;

use arena::{Arena, ArenaError, GROWTH_UNIT, HandoffLock, LastTask, Messenger};
use guest::{
    AbortHook, GlobalCell, Hypercalls, KernelEnv, KernelImage, KernelInstance, ModuleEngine,
    ModuleError, UserEnv, UserImage, UserInstance,
};
use types::{CpuId, Flow, TaskId, Trap, UnknownFlow, UserImageSpec};

use crate::port::{Message, Port};

/// Anchor of the monotonic guest clock, fixed at first use.
static CLOCK_ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

/// What a worker thread enters after instantiating the kernel.
#[derive(Debug)]
pub enum Role {
    /// CPU 0: write the boot inputs, then boot the machine.
    Primary { cmdline: String, initrd: Vec<u8> },
    /// A secondary CPU, entered through `_start_secondary`.
    Secondary { start_stack: u32 },
    /// A scheduled task, entered through `ret_from_fork`. `user` is set for
    /// clone()d tasks that duplicate the parent's executable.
    Task {
        prev: TaskId,
        new: TaskId,
        user: Option<UserImageSpec>,
    },
}

/// Everything a fresh worker thread is handed.
pub struct RunnerSpec {
    pub name: String,
    pub role: Role,
    pub arena: Arena,
    pub kernel: Arc<dyn KernelImage>,
    pub engine: Arc<dyn ModuleEngine>,
    pub port: Arc<dyn Port>,
    pub shared: Arc<RunnerShared>,
}

/// State shared between a worker thread and the orchestrator registry.
#[derive(Debug, Default)]
pub struct RunnerShared {
    pub lock: HandoffLock,
    pub last_task: LastTask,
    pub messenger: Messenger,
    shutdown: AtomicBool,
}

impl RunnerShared {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the owning thread to unwind. Wakes every call it may be parked
    /// in; the thread observes the flag after waking and traps out.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.lock.signal(1);
        self.messenger.complete(0);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Trap(#[from] Trap),
    #[error("failed to grow the arena for the initrd: {0}")]
    InitrdGrow(ArenaError),
    #[error("no user executable loaded")]
    NoExecutable,
    #[error("user executable failed to compile: {0}")]
    Compile(ModuleError),
    #[error("failed to instantiate the user executable: {0}")]
    Instantiate(ModuleError),
    #[error("{0}() returned (it should never return)")]
    EntryReturned(&'static str),
    #[error("{0}() is not defined")]
    EntryMissing(&'static str),
    #[error("signal return outside a signal dispatch")]
    StraySignalReturn,
    #[error("user_mode_tail: {0}")]
    BadFlow(UnknownFlow),
    #[error("no user instance to deliver a signal to")]
    NoUserInstance,
    #[error("kernel instance is gone")]
    KernelGone,
    #[error("user abort")]
    UserAbort,
}

/// The staged user executable. Compile errors are kept and surface at the
/// next user setup, not at the load site.
struct Executable {
    image: Result<Arc<dyn UserImage>, ModuleError>,
    params: UserImageSpec,
}

/// The instantiated user executable the signal path talks to. Weak: the
/// strong reference lives in the chain's call frames.
struct CurrentUser {
    instance: Weak<dyn UserInstance>,
    stack_pointer: Arc<GlobalCell>,
}

#[derive(Default)]
struct UserSlot {
    executable: Option<Executable>,
    current: Option<CurrentUser>,
}

/// One worker thread's runtime: the hypercall table and the glue that runs
/// the kernel and user modules on this thread.
pub struct Runner {
    name: String,
    arena: Arena,
    engine: Arc<dyn ModuleEngine>,
    port: Arc<dyn Port>,
    shared: Arc<RunnerShared>,
    kernel: Mutex<Option<Weak<dyn KernelInstance>>>,
    user: Mutex<UserSlot>,
}

impl Runner {
    /// Thread body of one worker. Instantiates the kernel against the
    /// shared arena, enters it according to the role, and for task roles
    /// drives the user chain. Returns when the thread was shut down or its
    /// postmortem park was released.
    pub fn run(spec: RunnerSpec) {
        let RunnerSpec {
            name,
            role,
            arena,
            kernel: image,
            engine,
            port,
            shared,
        } = spec;
        let runner = Arc::new(Runner {
            name,
            arena,
            engine,
            port,
            shared,
            kernel: Mutex::new(None),
            user: Mutex::new(UserSlot::default()),
        });

        if let Role::Task { user: Some(spec), .. } = &role {
            // A clone()d task starts from a copy of the parent's executable.
            runner.stage_executable(*spec);
        }

        let env = KernelEnv {
            arena: runner.arena.clone(),
            hypercalls: runner.clone(),
        };
        let kernel = match image.instantiate(env) {
            Ok(kernel) => kernel,
            Err(error) => {
                // No kernel came up, so there is nothing to dump.
                tracing::error!(runner = %runner.name, %error, "kernel instantiation failed");
                runner.log(format!("Wasm crash: {error}"));
                return;
            }
        };
        *runner.kernel.lock() = Some(Arc::downgrade(&kernel));

        match role {
            Role::Primary { cmdline, initrd } => {
                let result = runner.boot_primary(&kernel, &cmdline, &initrd);
                runner.finish_entry(&kernel, "_start", result);
            }
            Role::Secondary { start_stack } => {
                let result = kernel.secondary(start_stack).map_err(RunnerError::from);
                runner.finish_entry(&kernel, "_start_secondary", result);
            }
            Role::Task { prev, new, .. } => {
                let clone_pending = match kernel.ret_from_fork(prev, new) {
                    Ok(flag) => flag,
                    Err(Trap::Panic) => return runner.park_for_postmortem(),
                    Err(Trap::Shutdown) => return,
                    Err(trap) => return runner.fatal(&kernel, &RunnerError::Trap(trap)),
                };
                runner.user_chain(&kernel, clone_pending);
            }
        }
    }

    /// Boot writes, then `_start`. The command line was length-checked by
    /// the orchestrator; the kernel side reserves 512 bytes for it.
    fn boot_primary(
        &self,
        kernel: &Arc<dyn KernelInstance>,
        cmdline: &str,
        initrd: &[u8],
    ) -> Result<(), RunnerError> {
        self.port.post(Message::StartPrimary {
            init_task: kernel.init_task(),
        });

        let cmdline_buffer = kernel.boot_command_line();
        self.arena.write(cmdline_buffer, cmdline.as_bytes());
        self.arena.store_u8(cmdline_buffer + cmdline.len() as u32, 0);

        // Grow the arena to fit the initrd; the returned previous size is
        // where the new region starts.
        let units = initrd.len().div_ceil(GROWTH_UNIT);
        let initrd_start = self.arena.grow(units).map_err(RunnerError::InitrdGrow)? as u32;
        self.arena.write(initrd_start, initrd);
        self.arena
            .store_u32(kernel.initrd_start_cell(), initrd_start);
        self.arena
            .store_u32(kernel.initrd_end_cell(), initrd_start + initrd.len() as u32);

        kernel.boot()?;
        Ok(())
    }

    /// Settles a kernel entry that must never return normally.
    fn finish_entry(
        &self,
        kernel: &Arc<dyn KernelInstance>,
        entry: &'static str,
        result: Result<(), RunnerError>,
    ) {
        match result {
            Ok(()) => self.fatal(kernel, &RunnerError::EntryReturned(entry)),
            Err(RunnerError::Trap(Trap::Panic)) => self.park_for_postmortem(),
            Err(RunnerError::Trap(Trap::Shutdown)) => {}
            Err(error) => self.fatal(kernel, &error),
        }
    }

    /// The user execution chain: instantiate the staged executable, run it,
    /// and circle back whenever an exec staged a fresh image.
    fn user_chain(self: &Arc<Self>, kernel: &Arc<dyn KernelInstance>, mut clone_pending: bool) {
        loop {
            match self.user_once(kernel, &mut clone_pending) {
                Ok(never) => match never {},
                Err(RunnerError::Trap(Trap::ReloadProgram)) => continue,
                Err(RunnerError::Trap(Trap::Panic)) => return self.park_for_postmortem(),
                Err(RunnerError::Trap(Trap::Shutdown)) => return,
                Err(RunnerError::Trap(Trap::SignalReturn)) => {
                    return self.fatal(kernel, &RunnerError::StraySignalReturn);
                }
                Err(error) => return self.fatal(kernel, &error),
            }
        }
    }

    /// One setup+run pass over the staged user executable.
    fn user_once(
        self: &Arc<Self>,
        kernel: &Arc<dyn KernelInstance>,
        clone_pending: &mut bool,
    ) -> Result<Infallible, RunnerError> {
        // Captured before instantiation; the kernel wrote them during the
        // task switch or exec that got us here.
        let stack_pointer = kernel.user_stack_pointer();
        let tls_base = kernel.user_tls_base();

        let (image, params) = {
            let slot = self.user.lock();
            let executable = slot.executable.as_ref().ok_or(RunnerError::NoExecutable)?;
            let image = executable.image.clone().map_err(RunnerError::Compile)?;
            (image, executable.params)
        };

        let cell = Arc::new(GlobalCell::new(stack_pointer));
        let env = UserEnv {
            arena: self.arena.clone(),
            memory_base: params.data_start,
            table_base: params.table_start,
            stack_pointer: cell.clone(),
            kernel: kernel.clone(),
            abort: self.abort_hook(),
        };
        let instance = image.instantiate(env).map_err(RunnerError::Instantiate)?;
        instance.apply_data_relocs();
        if *clone_pending {
            // The child keeps running on the parent's thread-local block
            // unless the clone overrode it.
            instance.set_tls_base(tls_base);
        }
        {
            let mut slot = self.user.lock();
            slot.current = Some(CurrentUser {
                instance: Arc::downgrade(&instance),
                stack_pointer: cell,
            });
        }

        if *clone_pending {
            // Reset first: an exec from inside the callback must run the
            // new image through `_start`.
            *clone_pending = false;
            match instance.clone_callback() {
                None => Err(RunnerError::EntryMissing("__libc_clone_callback")),
                Some(Ok(())) => Err(RunnerError::EntryReturned("__libc_clone_callback")),
                Some(Err(trap)) => Err(trap.into()),
            }
        } else {
            instance.call_ctors();
            match instance.start() {
                Ok(()) => Err(RunnerError::EntryReturned("_start")),
                Err(trap) => Err(trap.into()),
            }
        }
    }

    /// Signal delivery, entered from the user-mode tail with the deliver
    /// bit set. Stack pointer and TLS base are fetched from the kernel when
    /// the handler starts and again, independently, when it returns.
    fn deliver_signal(&self) -> Result<(), Trap> {
        let Some(kernel) = self.kernel_instance() else {
            return Err(self.violation(&RunnerError::KernelGone));
        };
        let current = {
            let slot = self.user.lock();
            slot.current.as_ref().and_then(|current| {
                current
                    .instance
                    .upgrade()
                    .map(|instance| (instance, current.stack_pointer.clone()))
            })
        };
        let Some((instance, stack_pointer)) = current else {
            return Err(self.violation(&RunnerError::NoUserInstance));
        };

        // Set up the signal frame.
        stack_pointer.set(kernel.user_stack_pointer());
        instance.set_tls_base(kernel.user_tls_base());

        match instance.handle_signal() {
            None => Err(self.violation(&RunnerError::EntryMissing("__libc_handle_signal"))),
            Some(Ok(())) => {
                Err(self.violation(&RunnerError::EntryReturned("__libc_handle_signal")))
            }
            Some(Err(Trap::SignalReturn)) => {
                // Restore the signal frame; the kernel may have moved both
                // values while the handler ran.
                stack_pointer.set(kernel.user_stack_pointer());
                instance.set_tls_base(kernel.user_tls_base());
                Ok(())
            }
            // A genuine crash, or an exec from inside the handler.
            Some(Err(trap)) => Err(trap),
        }
    }

    /// Compiles and stages the executable described by `spec`, replacing
    /// whatever was staged before.
    fn stage_executable(&self, spec: UserImageSpec) {
        let code = self.arena.read_range(spec.bin_start, spec.bin_end);
        let image = self.engine.compile(&code);
        let mut slot = self.user.lock();
        // Drop our reference early; the running chain keeps the old
        // instance alive until its trap unwinds.
        slot.current = None;
        slot.executable = Some(Executable { image, params: spec });
    }

    /// Parks until something switches back to this thread, then reports
    /// which task the waker switched from.
    fn serialize_me(&self) -> Result<TaskId, Trap> {
        self.shared.lock.wait();
        if self.shared.shutdown_requested() {
            return Err(Trap::Shutdown);
        }
        Ok(self.shared.last_task.load())
    }

    /// Keeps a crashed or panicked thread around for inspection. Only a
    /// shutdown request releases it.
    fn park_for_postmortem(&self) {
        while !self.shared.shutdown_requested() {
            self.shared.lock.wait();
        }
    }

    /// The `wasm_error` path: report, let the kernel dump its own
    /// diagnostics, park for postmortem.
    fn fatal(&self, kernel: &Arc<dyn KernelInstance>, error: &RunnerError) {
        self.report_crash(error);
        match self.raise(kernel) {
            Trap::Shutdown => {}
            _ => self.park_for_postmortem(),
        }
    }

    /// Reports a host invariant violation from inside a hypercall, where
    /// only a `Trap` can travel back through guest frames. The thread parks
    /// once the trap reaches the chain boundary.
    fn violation(&self, error: &RunnerError) -> Trap {
        self.report_crash(error);
        match self.kernel_instance() {
            Some(kernel) => self.raise(&kernel),
            None => Trap::Panic,
        }
    }

    fn report_crash(&self, error: &RunnerError) {
        tracing::error!(runner = %self.name, %error, "guest execution failed");
        self.log(format!("Wasm crash: {error}"));
    }

    fn raise(&self, kernel: &Arc<dyn KernelInstance>) -> Trap {
        match kernel.raise_exception() {
            Ok(()) => {
                self.log("raise_exception() returned".to_string());
                Trap::Panic
            }
            Err(Trap::Shutdown) => Trap::Shutdown,
            // Normally ends in the panic hypercall, which already reported.
            Err(_) => Trap::Panic,
        }
    }

    fn kernel_instance(&self) -> Option<Arc<dyn KernelInstance>> {
        self.kernel.lock().as_ref().and_then(Weak::upgrade)
    }

    fn abort_hook(self: &Arc<Self>) -> AbortHook {
        let runner = self.clone();
        Arc::new(move || runner.violation(&RunnerError::UserAbort))
    }

    fn log(&self, message: String) {
        self.port.post(Message::Log {
            message: format!("[Runner {}]: {message}", self.name),
        });
    }
}

impl Hypercalls for Runner {
    fn start_cpu(&self, cpu: CpuId, idle_task: TaskId, start_stack: u32) -> Result<(), Trap> {
        // Threads cannot be spawned from guest context; the orchestrator
        // does it and registers the CPU before the thread runs.
        self.port.post(Message::StartSecondary {
            cpu,
            idle_task,
            start_stack,
        });
        Ok(())
    }

    fn stop_cpu(&self, cpu: CpuId) -> Result<(), Trap> {
        self.port.post(Message::StopSecondary { cpu });
        Ok(())
    }

    fn create_and_run_task(
        &self,
        prev: TaskId,
        new: TaskId,
        name: u32,
        user: Option<UserImageSpec>,
    ) -> Result<TaskId, Trap> {
        self.port.post(Message::CreateAndRunTask {
            prev,
            new,
            name: self.arena.cstring(name),
            user,
        });
        // The new task runs now; we resume when something switches back.
        self.serialize_me()
    }

    fn release_task(&self, dead: TaskId) -> Result<(), Trap> {
        self.port.post(Message::ReleaseTask { dead });
        Ok(())
    }

    fn serialize_tasks(&self, prev: TaskId, next: TaskId) -> Result<TaskId, Trap> {
        self.port.post(Message::SerializeTasks { prev, next });
        self.serialize_me()
    }

    fn panic(&self, msg: u32) -> Result<(), Trap> {
        let message = format!("Kernel panic: {}", self.arena.cstring(msg));
        tracing::error!(runner = %self.name, "{message}");
        self.log(message);
        Err(Trap::Panic)
    }

    fn dump_stacktrace(&self, buf: u32, max_size: u32) -> Result<(), Trap> {
        if max_size == 0 {
            return Ok(());
        }
        let trace = Backtrace::force_capture().to_string();
        let bytes = trace.as_bytes();
        let len = bytes.len().min(max_size as usize - 1);
        self.arena.write(buf, &bytes[..len]);
        self.arena.store_u8(buf + len as u32, 0);
        Ok(())
    }

    fn load_executable(&self, spec: UserImageSpec) -> Result<(), Trap> {
        self.stage_executable(spec);
        Ok(())
    }

    fn user_mode_tail(&self, flow: i32) -> Result<(), Trap> {
        let flow = match Flow::from_raw(flow) {
            Ok(flow) => flow,
            Err(unknown) => return Err(self.violation(&RunnerError::BadFlow(unknown))),
        };
        match flow {
            // Exec: never resume the interrupted user code. Takes
            // precedence over any pending signal work.
            Flow::Exec => Err(Trap::ReloadProgram),
            Flow::None => Ok(()),
            Flow::Signal(signal) => {
                // Deliver first (possibly stacked), then unwind to the
                // enclosing dispatch. An exec slips out through `?`.
                if signal.deliver {
                    self.deliver_signal()?;
                }
                if signal.sigreturn {
                    return Err(Trap::SignalReturn);
                }
                Ok(())
            }
        }
    }

    fn clock_monotonic(&self) -> Result<u64, Trap> {
        // Microsecond granularity, reported in nanoseconds.
        Ok(CLOCK_ANCHOR.elapsed().as_micros() as u64 * 1000)
    }

    fn console_put(&self, buf: u32, count: u32) -> Result<u32, Trap> {
        let bytes = self.arena.read_range(buf, buf + count);
        self.port.post(Message::ConsoleWrite {
            text: String::from_utf8_lossy(&bytes).into_owned(),
        });
        Ok(count)
    }

    fn console_get(&self, buf: u32, count: u32) -> Result<u32, Trap> {
        // Reset before posting so the reply cannot be missed. A shutdown
        // request that completed the cell before this reset will never
        // complete it again, so the flag has to be checked here too.
        self.shared.messenger.reset();
        if self.shared.shutdown_requested() {
            return Err(Trap::Shutdown);
        }
        self.port.post(Message::ConsoleRead {
            buffer: buf,
            count,
            reply: self.shared.messenger.clone(),
        });
        let transferred = self.shared.messenger.wait();
        if self.shared.shutdown_requested() {
            return Err(Trap::Shutdown);
        }
        Ok(transferred as u32)
    }
}
