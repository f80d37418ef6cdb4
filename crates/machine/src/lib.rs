pub mod config;
pub mod console;
pub mod machine;

pub use config::MachineConfig;
pub use console::{Console, StdoutConsole};
pub use machine::{BootError, Machine};
