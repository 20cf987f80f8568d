/// Absolute cycle number on the global clock.
pub type Cycle = u64;

/// Value of the cycle counter before the first advancement.
///
/// The first cycle executed by any strategy is `BEFORE_FIRST_CYCLE + 1`.
pub const BEFORE_FIRST_CYCLE: Cycle = 0;
