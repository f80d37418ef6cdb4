use thiserror::Error;

/// Non-local control transfer through guest code.
///
/// Guest entry points and hypercalls return `Result<_, Trap>` and propagate
/// these with `?`; the worker runtime catches them at the chain boundary.
/// Collapsing the guest call stack this way is the only supported form of
/// longjmp across module frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Trap {
    /// The guest kernel panicked; the reporting already happened and the
    /// thread parks for postmortem inspection.
    #[error("kernel panic")]
    Panic,
    /// An exec staged a new executable; unwind the whole user chain and run
    /// it from its entry point.
    #[error("reload program")]
    ReloadProgram,
    /// A signal handler finished; unwind to the dispatch that invoked it.
    #[error("signal return")]
    SignalReturn,
    /// The orchestrator is tearing this thread down; unwind and exit.
    #[error("shutdown")]
    Shutdown,
}
