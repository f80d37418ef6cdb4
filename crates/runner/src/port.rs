use arena::Messenger;
use types::{CpuId, TaskId, UserImageSpec};

/// Control messages a runner sends to the orchestrator. Both ends live in
/// one process, so posting is a direct call; the schema still keeps the
/// runner side free of any registry knowledge.
#[derive(Debug)]
pub enum Message {
    /// The primary CPU is up; `init_task` is where the kernel put its boot
    /// task, which doubles as CPU 0's idle task.
    StartPrimary { init_task: TaskId },
    /// Bring up a secondary CPU on a fresh thread.
    StartSecondary { cpu: CpuId, idle_task: TaskId, start_stack: u32 },
    /// Tear down a secondary CPU.
    StopSecondary { cpu: CpuId },
    /// Register `new` on a fresh thread and run it. `user` is set when the
    /// new task starts from a copy of a user executable (clone).
    CreateAndRunTask {
        prev: TaskId,
        new: TaskId,
        name: String,
        user: Option<UserImageSpec>,
    },
    /// Drop a task created by `CreateAndRunTask`.
    ReleaseTask { dead: TaskId },
    /// Wake `next`, recording `prev` as the task it was switched from. The
    /// sender parks itself right after posting.
    SerializeTasks { prev: TaskId, next: TaskId },
    /// Guest console output.
    ConsoleWrite { text: String },
    /// Copy up to `count` pending input bytes into the arena at `buffer`
    /// and complete `reply` with the transferred count (possibly 0).
    ConsoleRead { buffer: u32, count: u32, reply: Messenger },
    /// Diagnostics line for the orchestrator's log.
    Log { message: String },
}

/// Sink for runner control messages. The orchestrator implements this; the
/// runner never calls it while holding a lock.
pub trait Port: Send + Sync {
    fn post(&self, message: Message);
}
