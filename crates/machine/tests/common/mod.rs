// Scaffolding for the machine tests: a scripted guest kernel driven
// through a real `Machine`, with all observations funneled onto one
// shared tape.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use guest::{
    Hypercalls, KernelEnv, KernelImage, KernelInstance, ModuleEngine, ModuleError, UserImage,
};
use machine::{Console, Machine, MachineConfig};
use types::{TaskId, Trap};

pub const INIT_TASK: TaskId = TaskId(0x40);
pub const CMDLINE_BUF: u32 = 0x100;
pub const INITRD_START_CELL: u32 = 0x80;
pub const INITRD_END_CELL: u32 = 0x84;

/// A task id never registered anywhere. Switching to it parks the caller
/// until shutdown.
pub const NOBODY: TaskId = TaskId(0xdead);

/// Gate and sentinel for the one-time static initialization the kernel
/// module performs when it is first instantiated against the arena.
pub const STATIC_GATE: u32 = 0x88;
pub const STATIC_SENTINEL: u32 = 0x8c;
pub const SENTINEL_VALUE: u32 = 0x2222_2222;

#[derive(Default)]
pub struct Tape(Mutex<Vec<String>>);

impl Tape {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.0.lock().unwrap().iter().any(|e| e == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }
}

pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for condition");
        }
        thread::sleep(Duration::from_millis(2));
    }
}

pub type EntryHook = Box<dyn Fn(&KernelCtx) -> Result<(), Trap> + Send + Sync>;
pub type SecondaryHook = Box<dyn Fn(&KernelCtx, u32) -> Result<(), Trap> + Send + Sync>;
pub type ForkHook = Box<dyn Fn(&KernelCtx, TaskId, TaskId) -> Result<bool, Trap> + Send + Sync>;
pub type SyscallHook = Box<dyn Fn(&KernelCtx, u32, [u32; 6]) -> Result<u32, Trap> + Send + Sync>;

/// Behavior of the scripted kernel. Tests override the hooks they need.
pub struct KernelScript {
    pub on_boot: EntryHook,
    pub on_secondary: SecondaryHook,
    pub on_fork: ForkHook,
    pub on_syscall: SyscallHook,
    pub user_sp: AtomicU32,
    pub user_tls: AtomicU32,
}

impl Default for KernelScript {
    fn default() -> Self {
        Self {
            on_boot: Box::new(|_| Ok(())),
            on_secondary: Box::new(|_, _| Ok(())),
            on_fork: Box::new(|_, _, _| Ok(false)),
            on_syscall: Box::new(|_, _, _| Ok(0)),
            user_sp: AtomicU32::new(0x9000),
            user_tls: AtomicU32::new(0x100),
        }
    }
}

pub struct ScriptedKernel {
    pub script: Arc<KernelScript>,
    pub tape: Arc<Tape>,
}

impl KernelImage for ScriptedKernel {
    fn instantiate(&self, env: KernelEnv) -> Result<Arc<dyn KernelInstance>, ModuleError> {
        // One-time static initialization, gated in shared memory the way a
        // data segment initializer is. Every CPU instantiates the module;
        // only the first write may land.
        if env
            .arena
            .atomic_u32(STATIC_GATE)
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            env.arena.store_u32(STATIC_SENTINEL, SENTINEL_VALUE);
            self.tape.push("static init");
        }
        Ok(Arc::new(KernelCtx {
            env,
            script: self.script.clone(),
            tape: self.tape.clone(),
        }))
    }
}

/// An instantiated scripted kernel; handed to every hook as the context.
pub struct KernelCtx {
    pub env: KernelEnv,
    pub script: Arc<KernelScript>,
    pub tape: Arc<Tape>,
}

impl KernelCtx {
    pub fn record(&self, entry: impl Into<String>) {
        self.tape.push(entry);
    }

    pub fn hv(&self) -> &dyn Hypercalls {
        &*self.env.hypercalls
    }
}

impl KernelInstance for KernelCtx {
    fn boot(&self) -> Result<(), Trap> {
        (self.script.on_boot)(self)
    }

    fn secondary(&self, start_stack: u32) -> Result<(), Trap> {
        (self.script.on_secondary)(self, start_stack)
    }

    fn ret_from_fork(&self, prev: TaskId, new: TaskId) -> Result<bool, Trap> {
        (self.script.on_fork)(self, prev, new)
    }

    fn syscall(&self, nr: u32, args: [u32; 6]) -> Result<u32, Trap> {
        (self.script.on_syscall)(self, nr, args)
    }

    fn user_stack_pointer(&self) -> u32 {
        self.script.user_sp.load(Ordering::SeqCst)
    }

    fn user_tls_base(&self) -> u32 {
        self.script.user_tls.load(Ordering::SeqCst)
    }

    fn init_task(&self) -> TaskId {
        INIT_TASK
    }

    fn boot_command_line(&self) -> u32 {
        CMDLINE_BUF
    }

    fn initrd_start_cell(&self) -> u32 {
        INITRD_START_CELL
    }

    fn initrd_end_cell(&self) -> u32 {
        INITRD_END_CELL
    }

    fn raise_exception(&self) -> Result<(), Trap> {
        self.tape.push("raise_exception");
        Err(Trap::Panic)
    }
}

/// These machines run no user executables; a compile request is a bug.
pub struct NullEngine;

impl ModuleEngine for NullEngine {
    fn compile(&self, _code: &[u8]) -> Result<Arc<dyn UserImage>, ModuleError> {
        Err(ModuleError::BadImage("no user programs in this machine".into()))
    }
}

/// Guest console output, prefixed and pushed onto the tape.
pub struct TapeConsole(pub Arc<Tape>);

impl Console for TapeConsole {
    fn write(&mut self, text: &str) {
        self.0.push(format!("console {text:?}"));
    }
}

pub struct Fixture {
    pub tape: Arc<Tape>,
    pub machine: Machine,
}

pub fn test_config() -> MachineConfig {
    MachineConfig {
        initial_units: 2,
        max_units: 8,
        ..Default::default()
    }
}

pub fn boot_with(script: KernelScript, cmdline: &str, initrd: Vec<u8>) -> Fixture {
    let tape = Arc::new(Tape::default());
    let kernel = Arc::new(ScriptedKernel {
        script: Arc::new(script),
        tape: tape.clone(),
    });
    let machine = Machine::boot(
        kernel,
        Arc::new(NullEngine),
        cmdline,
        initrd,
        Box::new(TapeConsole(tape.clone())),
        test_config(),
    )
    .expect("machine boot");
    Fixture { tape, machine }
}
