pub mod id;
pub use id::{CpuId, TaskId};

pub mod flow;
pub use flow::{Flow, SignalFlow, UnknownFlow};

pub mod trap;
pub use trap::Trap;

pub mod image;
pub use image::UserImageSpec;
