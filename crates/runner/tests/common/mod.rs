// Scaffolding for the runner integration tests: a scripted guest kernel, a
// scripted user-executable engine, and a port that records every message.
// Hooks write human-readable entries onto one shared tape so tests can
// assert on the global order of events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arena::Arena;
use guest::{
    Hypercalls, KernelEnv, KernelImage, KernelInstance, ModuleEngine, ModuleError, UserEnv,
    UserImage, UserInstance,
};
use runner::{Message, Port, Role, Runner, RunnerShared, RunnerSpec};
use types::{TaskId, Trap};

pub const INIT_TASK: TaskId = TaskId(0x40);
pub const CMDLINE_BUF: u32 = 0x100;
pub const INITRD_START_CELL: u32 = 0x80;
pub const INITRD_END_CELL: u32 = 0x84;

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
    script: Arc<KernelScript>,
    tape: Arc<Tape>,
}

impl KernelImage for ScriptedKernel {
    fn instantiate(&self, env: KernelEnv) -> Result<Arc<dyn KernelInstance>, ModuleError> {
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

    pub fn set_user_frame(&self, sp: u32, tls: u32) {
        self.script.user_sp.store(sp, Ordering::SeqCst);
        self.script.user_tls.store(tls, Ordering::SeqCst);
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

pub type UserHook = Box<dyn Fn(&UserCtx) -> Result<(), Trap> + Send + Sync>;

/// Behavior of one scripted user executable, keyed by the first byte of its
/// code in the arena.
pub struct UserProgram {
    pub on_start: UserHook,
    pub on_clone_callback: Option<UserHook>,
    pub on_handle_signal: Option<UserHook>,
}

impl Default for UserProgram {
    fn default() -> Self {
        Self {
            on_start: Box::new(|_| Ok(())),
            on_clone_callback: None,
            on_handle_signal: None,
        }
    }
}

pub struct ScriptedEngine {
    programs: HashMap<u8, Arc<UserProgram>>,
    tape: Arc<Tape>,
}

impl ModuleEngine for ScriptedEngine {
    fn compile(&self, code: &[u8]) -> Result<Arc<dyn UserImage>, ModuleError> {
        let key = code
            .first()
            .copied()
            .ok_or_else(|| ModuleError::BadImage("empty image".into()))?;
        let program = self
            .programs
            .get(&key)
            .cloned()
            .ok_or_else(|| ModuleError::BadImage(format!("no program with marker {key:#x}")))?;
        Ok(Arc::new(ScriptedImage {
            program,
            tape: self.tape.clone(),
        }))
    }
}

struct ScriptedImage {
    program: Arc<UserProgram>,
    tape: Arc<Tape>,
}

impl UserImage for ScriptedImage {
    fn instantiate(&self, env: UserEnv) -> Result<Arc<dyn UserInstance>, ModuleError> {
        self.tape
            .push(format!("instantiate memory_base=0x{:x}", env.memory_base));
        Ok(Arc::new(UserCtx {
            env,
            program: self.program.clone(),
            tape: self.tape.clone(),
        }))
    }
}

/// An instantiated scripted user executable.
pub struct UserCtx {
    pub env: UserEnv,
    pub program: Arc<UserProgram>,
    pub tape: Arc<Tape>,
}

impl UserCtx {
    pub fn record(&self, entry: impl Into<String>) {
        self.tape.push(entry);
    }
}

impl UserInstance for UserCtx {
    fn start(&self) -> Result<(), Trap> {
        (self.program.on_start)(self)
    }

    fn clone_callback(&self) -> Option<Result<(), Trap>> {
        self.program.on_clone_callback.as_ref().map(|hook| hook(self))
    }

    fn handle_signal(&self) -> Option<Result<(), Trap>> {
        self.program.on_handle_signal.as_ref().map(|hook| hook(self))
    }

    fn apply_data_relocs(&self) {
        self.tape.push("apply_data_relocs");
    }

    fn call_ctors(&self) {
        self.tape.push("call_ctors");
    }

    fn set_tls_base(&self, tls: u32) {
        self.tape.push(format!("set_tls_base 0x{tls:x}"));
    }
}

/// Records every posted message; answers console reads from a canned input
/// queue the way the orchestrator would.
pub struct RecordingPort {
    arena: Arena,
    pub input: Mutex<Vec<u8>>,
    messages: Mutex<Vec<Message>>,
}

impl RecordingPort {
    pub fn logs(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                Message::Log { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn console_writes(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                Message::ConsoleWrite { text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn rendered(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| format!("{m:?}"))
            .collect()
    }
}

impl Port for RecordingPort {
    fn post(&self, message: Message) {
        if let Message::ConsoleRead { buffer, count, reply } = &message {
            let mut input = self.input.lock().unwrap();
            let n = (*count as usize).min(input.len());
            let bytes: Vec<u8> = input.drain(..n).collect();
            self.arena.write(*buffer, &bytes);
            reply.complete(n as i32);
        }
        self.messages.lock().unwrap().push(message);
    }
}

/// One runner under test: its arena, tape, port and shared handles.
pub struct Fixture {
    pub arena: Arena,
    pub tape: Arc<Tape>,
    pub port: Arc<RecordingPort>,
    pub shared: Arc<RunnerShared>,
}

impl Fixture {
    pub fn new() -> Self {
        let arena = Arena::new(2, 4);
        Self {
            tape: Arc::new(Tape::default()),
            port: Arc::new(RecordingPort {
                arena: arena.clone(),
                input: Mutex::new(Vec::new()),
                messages: Mutex::new(Vec::new()),
            }),
            shared: Arc::new(RunnerShared::new()),
            arena,
        }
    }

    pub fn spawn(
        &self,
        script: KernelScript,
        programs: Vec<(u8, UserProgram)>,
        role: Role,
    ) -> JoinHandle<()> {
        let spec = RunnerSpec {
            name: "test".into(),
            role,
            arena: self.arena.clone(),
            kernel: Arc::new(ScriptedKernel {
                script: Arc::new(script),
                tape: self.tape.clone(),
            }),
            engine: Arc::new(ScriptedEngine {
                programs: programs
                    .into_iter()
                    .map(|(marker, program)| (marker, Arc::new(program)))
                    .collect(),
                tape: self.tape.clone(),
            }),
            port: self.port.clone(),
            shared: self.shared.clone(),
        };
        thread::spawn(move || Runner::run(spec))
    }

    /// Releases whatever the runner is parked in and joins it.
    pub fn finish(&self, handle: JoinHandle<()>) {
        self.shared.request_shutdown();
        handle.join().unwrap();
    }
}
