use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::Opcode;

/// Number of gas categories tracked by [`GasProfile`].
const GAS_CATEGORY_COUNT: usize = 6;

/// Categories of gas consumption for profiling and debugging.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum GasCategory {
    /// Base cost for executing opcodes.
    OpcodeBase = 0,
    /// Size-dependent cost of big-integer arithmetic.
    Arithmetic = 1,
    /// Cost for byte-proportional work (concatenation, slicing, hashing).
    Memory = 2,
    /// Cost for creating and copying aggregates.
    HeapAllocation = 3,
    /// Cost for call and context-switch overhead.
    CallOverhead = 4,
    /// Cost for host function execution.
    HostFunction = 5,
}

impl GasCategory {
    pub const fn as_str(&self) -> &'static str {
        match self {
            GasCategory::OpcodeBase => "Opcode Base",
            GasCategory::Arithmetic => "Arithmetic",
            GasCategory::Memory => "Memory",
            GasCategory::HeapAllocation => "Heap Allocation",
            GasCategory::CallOverhead => "Call Overhead",
            GasCategory::HostFunction => "Host Function",
        }
    }

    /// All categories in discriminant order.
    const ALL: [GasCategory; GAS_CATEGORY_COUNT] = [
        GasCategory::OpcodeBase,
        GasCategory::Arithmetic,
        GasCategory::Memory,
        GasCategory::HeapAllocation,
        GasCategory::CallOverhead,
        GasCategory::HostFunction,
    ];
}

/// Gas consumption broken down by [`GasCategory`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GasProfile {
    counts: [u64; GAS_CATEGORY_COUNT],
}

impl GasProfile {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn add(&mut self, category: GasCategory, amount: u64) {
        let slot = &mut self.counts[category as usize];
        *slot = slot.saturating_add(amount);
    }

    pub fn get(&self, category: GasCategory) -> u64 {
        self.counts[category as usize]
    }

    pub fn total(&self) -> u64 {
        self.counts
            .iter()
            .fold(0u64, |acc, &v| acc.saturating_add(v))
    }

    /// Iterates categories and their totals in discriminant order.
    pub fn iter(&self) -> impl Iterator<Item = (GasCategory, u64)> {
        GasCategory::ALL.into_iter().zip(self.counts)
    }
}

/// Gas limit used when a run does not specify one.
pub const DEFAULT_GAS_LIMIT: u64 = 10_000_000;

/// Per-run cost table supplied by the host.
///
/// Opcode costs default to the base costs in the instruction table; the
/// surcharges scale the size-dependent instructions.
#[derive(Clone, Debug)]
pub struct GasSchedule {
    opcode: [u64; 256],
    /// Per byte produced or hashed (cat, left, right, host hashing).
    pub per_byte: u64,
    /// Per 64-bit word of operand for multiplication and shifts.
    pub per_word: u64,
    /// Per aggregate entry written or copied.
    pub per_entry: u64,
    /// Fixed cost of entering a script context.
    pub context_switch: u64,
}

impl Default for GasSchedule {
    fn default() -> Self {
        let mut opcode = [0u64; 256];
        for op in Opcode::ALL {
            opcode[*op as usize] = op.base_gas();
        }
        Self {
            opcode,
            per_byte: 1,
            per_word: 1,
            per_entry: 2,
            context_switch: 20,
        }
    }
}

impl GasSchedule {
    pub fn opcode_cost(&self, op: Opcode) -> u64 {
        self.opcode[op as usize]
    }

    pub fn set_opcode_cost(&mut self, op: Opcode, cost: u64) -> &mut Self {
        self.opcode[op as usize] = cost;
        self
    }

    /// Surcharge for `bytes` bytes of work.
    pub fn bytes_cost(&self, bytes: usize) -> u64 {
        self.per_byte.saturating_mul(bytes as u64)
    }

    /// Surcharge for operands totalling `bits` bits.
    pub fn words_cost(&self, bits: u64) -> u64 {
        self.per_word.saturating_mul(bits.div_ceil(64))
    }

    pub fn entries_cost(&self, entries: usize) -> u64 {
        self.per_entry.saturating_mul(entries as u64)
    }
}

/// Tracks gas consumption against a limit.
///
/// A charge that does not fit in the remaining budget fails with
/// [`VMError::OutOfGas`] and is not recorded.
#[derive(Clone, Debug)]
pub struct GasMeter {
    limit: u64,
    used: u64,
    price: u64,
    profile: GasProfile,
}

impl GasMeter {
    pub fn new(limit: u64, price: u64) -> Self {
        Self {
            limit,
            used: 0,
            price,
            profile: GasProfile::new(),
        }
    }

    pub fn charge(&mut self, amount: u64, category: GasCategory) -> Result<(), VMError> {
        let remaining = self.remaining();
        if amount > remaining {
            return Err(VMError::OutOfGas {
                required: amount,
                remaining,
            });
        }
        self.used += amount;
        self.profile.add(category, amount);
        Ok(())
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.limit - self.used
    }

    pub fn price(&self) -> u64 {
        self.price
    }

    /// Fee owed for the gas used so far.
    pub fn fee(&self) -> u128 {
        u128::from(self.used) * u128::from(self.price)
    }

    pub fn profile(&self) -> &GasProfile {
        &self.profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_accumulates_per_category() {
        let mut profile = GasProfile::new();
        profile.add(GasCategory::Memory, 5);
        profile.add(GasCategory::Memory, 7);
        profile.add(GasCategory::HostFunction, 1);
        assert_eq!(profile.get(GasCategory::Memory), 12);
        assert_eq!(profile.total(), 13);
        let names: Vec<_> = profile.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(names.first(), Some(&"Opcode Base"));
        assert_eq!(names.len(), GAS_CATEGORY_COUNT);
    }

    #[test]
    fn failed_charge_is_not_recorded() {
        let mut meter = GasMeter::new(10, 3);
        meter.charge(8, GasCategory::OpcodeBase).unwrap();
        assert!(matches!(
            meter.charge(3, GasCategory::Arithmetic),
            Err(VMError::OutOfGas {
                required: 3,
                remaining: 2
            })
        ));
        assert_eq!(meter.used(), 8);
        assert_eq!(meter.profile().get(GasCategory::Arithmetic), 0);
        meter.charge(2, GasCategory::OpcodeBase).unwrap();
        assert_eq!(meter.remaining(), 0);
        assert_eq!(meter.fee(), 30);
    }

    #[test]
    fn schedule_defaults_to_table_costs() {
        let mut schedule = GasSchedule::default();
        assert_eq!(schedule.opcode_cost(Opcode::Switch), Opcode::Switch.base_gas());
        schedule.set_opcode_cost(Opcode::Add, 40);
        assert_eq!(schedule.opcode_cost(Opcode::Add), 40);
        assert_eq!(schedule.words_cost(65), 2);
        assert_eq!(schedule.bytes_cost(10), 10);
    }
}
