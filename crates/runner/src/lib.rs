pub mod port;
pub use port::{Message, Port};

pub mod runner;
pub use runner::{Role, Runner, RunnerError, RunnerShared, RunnerSpec};
