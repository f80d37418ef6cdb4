/// Sizing knobs for a machine.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Arena units committed before boot. Must cover the kernel's
    /// statically linked memory image.
    // TODO: derive this from the kernel image instead of hardcoding it.
    pub initial_units: usize,
    /// Ceiling on arena growth, in units.
    pub max_units: usize,
    /// Longest accepted boot command line, including the terminator.
    pub cmdline_limit: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            initial_units: 30,
            max_units: 0x1000,
            cmdline_limit: 512,
        }
    }
}
