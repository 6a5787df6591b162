//! Runtime configuration types.

/// Runtime configuration for the VM.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Print each instruction and the stack contents while executing.
    pub trace_execution: bool,
    /// Disassemble each function after it is compiled.
    pub print_code: bool,
    /// Run the garbage collector on every dispatch step.
    pub stress_gc: bool,
    /// Log garbage collection events to stderr.
    pub log_gc: bool,
}
