use std::sync::atomic::{AtomicU32, Ordering};

/// A mutable module global owned by the host side of the import object,
/// e.g. the user executable's `__stack_pointer`.
#[derive(Debug)]
pub struct GlobalCell(AtomicU32);

impl GlobalCell {
    pub fn new(value: u32) -> Self {
        Self(AtomicU32::new(value))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: u32) {
        self.0.store(value, Ordering::Release);
    }
}
