//! Operational limits of the target store class, as named constants.

use serde::{Deserialize, Serialize};

/// Maximum OR-able values the store's membership operator accepts in one
/// query.
pub const DEFAULT_DISJUNCTION_CAP: usize = 10;

/// Maximum write operations inside one store transaction.
pub const DEFAULT_OPERATION_BUDGET: usize = 500;

/// Write coordinator attempts before an optimistic conflict is surfaced.
pub const DEFAULT_TXN_ATTEMPTS: usize = 5;

/// Concurrent in-flight store requests during relation/shard fan-out.
pub const DEFAULT_FANOUT_WIDTH: usize = 16;

/// Tunable engine limits, resolved from configuration with the constants
/// above as defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineLimits {
    pub disjunction_cap: usize,
    pub operation_budget: usize,
    pub txn_attempts: usize,
    pub fanout_width: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            disjunction_cap: DEFAULT_DISJUNCTION_CAP,
            operation_budget: DEFAULT_OPERATION_BUDGET,
            txn_attempts: DEFAULT_TXN_ATTEMPTS,
            fanout_width: DEFAULT_FANOUT_WIDTH,
        }
    }
}
