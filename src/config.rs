/// Cross-cutting knobs read by search and compilation.
///
/// This is an explicitly constructed object passed by reference into
/// [`crate::search::SearchEngine`] and [`crate::codegen::compile`], not process
/// globals, so tests can run with isolated configurations concurrently. The
/// search engine snapshots it at search start; mutating a config during an
/// active search has no effect on that search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// Target device for all subsequent compilation and execution.
    pub gpu_device_id: usize,
    /// Demote verification-confidence and compiler-optimization failures from
    /// hard failures to recorded warnings. Never masks construction errors.
    pub bypass_compile_errors: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gpu_device_id: 0,
            bypass_compile_errors: false,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_gpu_device_id(&mut self, device_id: usize) -> &mut Self {
        self.gpu_device_id = device_id;
        self
    }

    pub fn bypass_compile_errors(&mut self, value: bool) -> &mut Self {
        self.bypass_compile_errors = value;
        self
    }
}
