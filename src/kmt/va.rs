//! Kernel-side GPU virtual address rules: reservations, placement and fault injection.

use crate::error::{KmtError, KmtResult};
use crate::utils::{MAX_SVM_ADDRESS, PAGE_SIZE_64K};
use serde::{Deserialize, Serialize};

/// VA chosen when the caller supplies neither a base nor a minimum.
pub const DEFAULT_VA_ORIGIN: u64 = PAGE_SIZE_64K;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaReservation {
    pub base: u64,
    pub minimum_address: u64,
    pub maximum_address: u64,
}

/// Forces the next `max - count` map calls to fail. Inactive while `max == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FaultBudget {
    pub count: u32,
    pub max: u32,
}

impl FaultBudget {
    #[must_use]
    pub const fn new(count: u32, max: u32) -> Self {
        Self { count, max }
    }

    /// Consumes one injected failure if any remain.
    fn trip(&mut self) -> bool {
        if self.max != 0 && self.count < self.max {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default)]
pub struct VaSpace {
    last_reservation: Option<VaReservation>,
    fault: FaultBudget,
}

impl VaSpace {
    #[must_use]
    pub fn new(fault: FaultBudget) -> Self {
        Self {
            last_reservation: None,
            fault,
        }
    }

    /// Records a reservation. Always succeeds; replaces any outstanding one.
    pub fn reserve(&mut self, minimum_address: u64, maximum_address: u64) -> VaReservation {
        let reservation = VaReservation {
            base: minimum_address,
            minimum_address,
            maximum_address,
        };
        self.last_reservation = Some(reservation);
        reservation
    }

    #[must_use]
    pub const fn last_reservation(&self) -> Option<VaReservation> {
        self.last_reservation
    }

    pub fn set_fault_budget(&mut self, fault: FaultBudget) {
        self.fault = fault;
    }

    #[must_use]
    pub const fn fault_budget(&self) -> FaultBudget {
        self.fault
    }

    /// Decides where a map call places its allocation.
    ///
    /// A nonzero `base` must sit inside `[minimum, maximum]` (zero bounds are open) and is only
    /// accepted with the `MAX_SVM_ADDRESS` sentinel as maximum or when it names the base of the
    /// outstanding reservation, which is then consumed. Injected faults fire after placement has
    /// been validated and before anything is consumed.
    ///
    /// # Errors
    /// `OutOfRange` for a rejected placement, `OperationFailed` for an injected fault.
    pub fn resolve_map(&mut self, base: u64, minimum: u64, maximum: u64) -> KmtResult<u64> {
        let out_of_range = || KmtError::OutOfRange {
            address: base,
            minimum,
            maximum,
        };

        let mut consumes_reservation = false;
        let va = if base == 0 {
            if minimum != 0 { minimum } else { DEFAULT_VA_ORIGIN }
        } else {
            if (minimum != 0 && base < minimum) || (maximum != 0 && base > maximum) {
                return Err(out_of_range());
            }
            if maximum != MAX_SVM_ADDRESS {
                match self.last_reservation {
                    Some(reservation) if reservation.base == base => consumes_reservation = true,
                    _ => return Err(out_of_range()),
                }
            }
            base
        };

        if self.fault.trip() {
            return Err(KmtError::OperationFailed(format!(
                "injected map fault {}/{}",
                self.fault.count, self.fault.max
            )));
        }

        if consumes_reservation {
            self.last_reservation = None;
        }
        Ok(va)
    }
}
