use thiserror::Error;

/// Control-flow request reported by the guest kernel at the tail of a
/// syscall, when plain fall-through back into user code is not enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// An exec replaced the process image; the staged executable must run
    /// instead of resuming the interrupted user code.
    Exec,
    /// Nothing special, resume normally.
    None,
    /// Deliver a pending signal and/or return from a finished handler.
    Signal(SignalFlow),
}

/// Signal work requested by the kernel. Both bits may be set at once: a
/// sigreturn site can itself have another pending signal to deliver first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalFlow {
    /// Invoke the registered handler before anything else.
    pub deliver: bool,
    /// Unwind to the dispatch that invoked the current handler.
    pub sigreturn: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown flow code {0}")]
pub struct UnknownFlow(pub i32);

impl Flow {
    /// Decodes the raw flow word passed to the user-mode tail hypercall.
    pub fn from_raw(raw: i32) -> Result<Flow, UnknownFlow> {
        match raw {
            -1 => Ok(Flow::Exec),
            0 => Ok(Flow::None),
            1..=3 => Ok(Flow::Signal(SignalFlow {
                deliver: raw & 1 != 0,
                sigreturn: raw & 2 != 0,
            })),
            other => Err(UnknownFlow(other)),
        }
    }
}
