//! Per-run configuration supplied by the host.

use crate::virtual_machine::vm::gas::{DEFAULT_GAS_LIMIT, GasSchedule};

/// Registers per context when the host does not choose otherwise.
pub const DEFAULT_REGISTER_COUNT: usize = 32;
/// Largest register file addressable by a one-byte operand.
pub const MAX_REGISTER_COUNT: usize = 256;
pub const DEFAULT_MAX_STACK_DEPTH: usize = 1024;
pub const DEFAULT_MAX_CALL_DEPTH: usize = 128;
pub const DEFAULT_MAX_CONTEXT_DEPTH: usize = 16;
pub const DEFAULT_MAX_SCRIPT_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_INTEGER_BITS: u64 = 8192;
pub const DEFAULT_MAX_HEAP_OBJECTS: usize = 4096;

/// Resource bounds enforced during a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmLimits {
    /// Registers per context, at most [`MAX_REGISTER_COUNT`].
    pub registers: usize,
    pub max_stack_depth: usize,
    /// Frames across all contexts, root frames included.
    pub max_call_depth: usize,
    pub max_context_depth: usize,
    pub max_script_size: usize,
    /// Widest integer any loaded literal or arithmetic result may have.
    pub max_integer_bits: u64,
    pub max_heap_objects: usize,
}

impl Default for VmLimits {
    fn default() -> Self {
        Self {
            registers: DEFAULT_REGISTER_COUNT,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            max_context_depth: DEFAULT_MAX_CONTEXT_DEPTH,
            max_script_size: DEFAULT_MAX_SCRIPT_SIZE,
            max_integer_bits: DEFAULT_MAX_INTEGER_BITS,
            max_heap_objects: DEFAULT_MAX_HEAP_OBJECTS,
        }
    }
}

impl VmLimits {
    /// Register count clamped to what a register operand can address.
    pub fn register_count(&self) -> usize {
        self.registers.clamp(1, MAX_REGISTER_COUNT)
    }
}

/// Parameters of a single run.
#[derive(Clone, Debug)]
pub struct RunParams {
    pub gas_price: u64,
    pub gas_limit: u64,
    /// Mutating extcalls and native contexts become no-ops.
    pub read_only: bool,
    pub limits: VmLimits,
    pub schedule: GasSchedule,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            gas_price: 1,
            gas_limit: DEFAULT_GAS_LIMIT,
            read_only: false,
            limits: VmLimits::default(),
            schedule: GasSchedule::default(),
        }
    }
}

impl RunParams {
    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_limits(mut self, limits: VmLimits) -> Self {
        self.limits = limits;
        self
    }
}
