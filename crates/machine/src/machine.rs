use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use thiserror::Error;

use arena::Arena;
use guest::{KernelImage, ModuleEngine};
use runner::{Message, Port, Role, Runner, RunnerShared, RunnerSpec};
use types::{CpuId, TaskId, UserImageSpec};

use crate::config::MachineConfig;
use crate::console::Console;

#[derive(Debug, Error)]
pub enum BootError {
    #[error("boot command line is {len} bytes with the terminator; the limit is {limit}")]
    CmdlineTooLong { len: usize, limit: usize },
    #[error("failed to spawn a worker thread: {0}")]
    Spawn(io::Error),
}

/// A running guest machine: one shared arena, a kernel image, and a
/// registry of worker threads the guest schedules itself onto.
///
/// Dropping the machine shuts it down: every worker is unparked, asked to
/// unwind, and joined.
pub struct Machine {
    inner: Arc<MachineInner>,
}

impl Machine {
    /// Boots the machine. CPU 0 comes up on a fresh thread, writes the
    /// boot inputs into the arena, and enters the kernel; everything else
    /// (secondary CPUs, tasks) is created on demand through the port.
    pub fn boot(
        kernel: Arc<dyn KernelImage>,
        engine: Arc<dyn ModuleEngine>,
        cmdline: &str,
        initrd: Vec<u8>,
        console: Box<dyn Console>,
        config: MachineConfig,
    ) -> Result<Self, BootError> {
        let len = cmdline.len() + 1;
        if len > config.cmdline_limit {
            return Err(BootError::CmdlineTooLong {
                len,
                limit: config.cmdline_limit,
            });
        }
        let inner = Arc::new_cyclic(|me| MachineInner {
            me: me.clone(),
            arena: Arena::new(config.initial_units, config.max_units),
            kernel,
            engine,
            console: Mutex::new(console),
            registry: Mutex::new(Registry::default()),
            input: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
        });
        inner.spawn_cpu(
            CpuId::PRIMARY,
            None,
            Role::Primary {
                cmdline: cmdline.to_string(),
                initrd,
            },
        )?;
        Ok(Self { inner })
    }

    /// Queues console input; the guest sees it at its next read.
    pub fn key_input(&self, text: &str) {
        self.inner.input.lock().extend_from_slice(text.as_bytes());
    }

    pub fn arena(&self) -> &Arena {
        &self.inner.arena
    }

    pub fn live_cpus(&self) -> Vec<CpuId> {
        let registry = self.inner.registry.lock();
        let mut cpus: Vec<CpuId> = registry.cpus.keys().copied().collect();
        cpus.sort_by_key(|cpu| cpu.0);
        cpus
    }

    pub fn live_tasks(&self) -> Vec<TaskId> {
        let registry = self.inner.registry.lock();
        let mut tasks: Vec<TaskId> = registry.tasks.keys().copied().collect();
        tasks.sort_by_key(|task| task.0);
        tasks
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

/// One live worker thread, indexed by CPU and/or task id. CPU workers own
/// two registry entries once their idle task is known.
struct WorkerHandle {
    name: String,
    shared: Arc<RunnerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    idle_task: Mutex<Option<TaskId>>,
}

impl WorkerHandle {
    fn new(name: String, idle_task: Option<TaskId>) -> Self {
        Self {
            name,
            shared: Arc::new(RunnerShared::new()),
            thread: Mutex::new(None),
            idle_task: Mutex::new(idle_task),
        }
    }

    /// Unparks the worker and waits for its thread to unwind. A worker
    /// stopping itself only raises the flag; its thread exits once the
    /// hypercall it is inside returns.
    fn terminate(&self) {
        self.shared.request_shutdown();
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            tracing::error!(worker = %self.name, "worker thread panicked");
        }
    }
}

#[derive(Default)]
struct Registry {
    cpus: HashMap<CpuId, Arc<WorkerHandle>>,
    tasks: HashMap<TaskId, Arc<WorkerHandle>>,
}

struct MachineInner {
    me: Weak<MachineInner>,
    arena: Arena,
    kernel: Arc<dyn KernelImage>,
    engine: Arc<dyn ModuleEngine>,
    console: Mutex<Box<dyn Console>>,
    registry: Mutex<Registry>,
    input: Mutex<Vec<u8>>,
    closing: AtomicBool,
}

impl MachineInner {
    /// Registers a CPU (and its idle task, when known up front) and spawns
    /// its thread. CPU 0's idle task is registered later, when the kernel
    /// reports it through `StartPrimary`.
    fn spawn_cpu(&self, cpu: CpuId, idle_task: Option<TaskId>, role: Role) -> Result<(), BootError> {
        let mut name = format!("CPU {cpu} [boot+idle]");
        if let Some(idle_task) = idle_task {
            name.push_str(&format!(" ({idle_task})"));
        }
        let handle = Arc::new(WorkerHandle::new(name, idle_task));
        {
            let mut registry = self.registry.lock();
            if registry.cpus.contains_key(&cpu) {
                tracing::warn!(%cpu, "CPU is already running");
                return Ok(());
            }
            registry.cpus.insert(cpu, handle.clone());
            if let Some(task) = idle_task {
                registry.tasks.insert(task, handle.clone());
            }
        }
        if let Err(error) = self.spawn_worker(&handle, role) {
            let mut registry = self.registry.lock();
            registry.cpus.remove(&cpu);
            if let Some(task) = idle_task {
                registry.tasks.remove(&task);
            }
            return Err(error);
        }
        Ok(())
    }

    /// Registers a task switched to for the first time and spawns its
    /// thread. `ret_from_fork` on that thread finishes the task switch.
    fn spawn_task(&self, prev: TaskId, new: TaskId, name: &str, user: Option<UserImageSpec>) {
        let handle = Arc::new(WorkerHandle::new(format!("{name} ({new})"), None));
        {
            let mut registry = self.registry.lock();
            if registry.tasks.contains_key(&new) {
                tracing::warn!(task = %new, "task id is already registered");
                return;
            }
            registry.tasks.insert(new, handle.clone());
        }
        if let Err(error) = self.spawn_worker(&handle, Role::Task { prev, new, user }) {
            self.registry.lock().tasks.remove(&new);
            tracing::error!(task = %new, %error, "failed to start the task worker");
        }
    }

    /// Spawns the thread for an already-registered worker. Registration
    /// comes first: the thread may post messages as soon as it runs.
    fn spawn_worker(&self, handle: &Arc<WorkerHandle>, role: Role) -> Result<(), BootError> {
        let Some(port) = self.me.upgrade() else {
            return Ok(());
        };
        let spec = RunnerSpec {
            name: handle.name.clone(),
            role,
            arena: self.arena.clone(),
            kernel: self.kernel.clone(),
            engine: self.engine.clone(),
            port,
            shared: handle.shared.clone(),
        };
        let thread = thread::Builder::new()
            .name(handle.name.clone())
            .spawn(move || Runner::run(spec))
            .map_err(BootError::Spawn)?;
        *handle.thread.lock() = Some(thread);
        Ok(())
    }

    fn stop_cpu(&self, cpu: CpuId) {
        if cpu.is_primary() {
            // Usually the sign of a kernel panic with a corrupted stack.
            tracing::error!("request to stop CPU 0; ignoring");
            return;
        }
        let handle = {
            let mut registry = self.registry.lock();
            let Some(handle) = registry.cpus.remove(&cpu) else {
                tracing::warn!(%cpu, "CPU is already stopped");
                return;
            };
            if let Some(task) = *handle.idle_task.lock() {
                registry.tasks.remove(&task);
            }
            handle
        };
        tracing::info!(%cpu, "stopping CPU");
        handle.terminate();
    }

    fn release_task(&self, dead: TaskId) {
        let Some(handle) = self.registry.lock().tasks.remove(&dead) else {
            tracing::warn!(task = %dead, "release for an unregistered task");
            return;
        };
        // Dead tasks never get scheduled again, so the worker is parked in
        // a switch that will never come. Terminating wakes and unwinds it.
        handle.terminate();
    }

    fn switch_to(&self, prev: TaskId, next: TaskId) {
        let Some(handle) = self.registry.lock().tasks.get(&next).cloned() else {
            tracing::warn!(task = %next, "switch to an unregistered task");
            return;
        };
        // The woken thread reads last_task right after its wait returns;
        // the store must land first.
        handle.shared.last_task.store(prev);
        handle.shared.lock.signal(1);
    }

    fn shutdown(&self) {
        self.closing.store(true, Ordering::Release);
        let workers = {
            let mut registry = self.registry.lock();
            let registry = &mut *registry;
            let mut workers: Vec<Arc<WorkerHandle>> = Vec::new();
            let cpus = registry.cpus.drain().map(|(_, handle)| handle);
            let tasks = registry.tasks.drain().map(|(_, handle)| handle);
            for handle in cpus.chain(tasks) {
                if !workers.iter().any(|known| Arc::ptr_eq(known, &handle)) {
                    workers.push(handle);
                }
            }
            workers
        };
        // Raise every flag before joining anything; a parked worker may be
        // waiting for a handoff that another worker will never complete.
        for worker in &workers {
            worker.shared.request_shutdown();
        }
        for worker in &workers {
            worker.terminate();
        }
    }
}

impl Port for MachineInner {
    fn post(&self, message: Message) {
        // No new work once shutdown began; pending waits are released by
        // the per-worker shutdown flags instead.
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        match message {
            Message::StartPrimary { init_task } => {
                // The kernel's boot task sits in static storage and becomes
                // CPU 0's idle task, so only the kernel knows its id.
                tracing::info!(%init_task, "CPU 0 is up");
                let mut registry = self.registry.lock();
                if let Some(primary) = registry.cpus.get(&CpuId::PRIMARY).cloned() {
                    *primary.idle_task.lock() = Some(init_task);
                    registry.tasks.insert(init_task, primary);
                }
            }
            Message::StartSecondary {
                cpu,
                idle_task,
                start_stack,
            } => {
                if cpu.is_primary() {
                    tracing::error!("request to start CPU 0 as a secondary; ignoring");
                    return;
                }
                tracing::info!(%cpu, %idle_task, start_stack, "starting secondary CPU");
                if let Err(error) =
                    self.spawn_cpu(cpu, Some(idle_task), Role::Secondary { start_stack })
                {
                    tracing::error!(%cpu, %error, "failed to start the CPU");
                }
            }
            Message::StopSecondary { cpu } => self.stop_cpu(cpu),
            Message::CreateAndRunTask {
                prev,
                new,
                name,
                user,
            } => self.spawn_task(prev, new, &name, user),
            Message::ReleaseTask { dead } => self.release_task(dead),
            Message::SerializeTasks { prev, next } => self.switch_to(prev, next),
            Message::ConsoleWrite { text } => self.console.lock().write(&text),
            Message::ConsoleRead {
                buffer,
                count,
                reply,
            } => {
                let bytes: Vec<u8> = {
                    let mut input = self.input.lock();
                    let n = (count as usize).min(input.len());
                    input.drain(..n).collect()
                };
                self.arena.write(buffer, &bytes);
                reply.complete(bytes.len() as i32);
            }
            Message::Log { message } => tracing::info!("{message}"),
        }
    }
}
