//! Operating system predicate.

use serde::{Deserialize, Serialize};

use super::{ConditionScope, Predicate};
use crate::attributes::Attributes;

/// Requires a 32- or 64-bit operating system
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OsCondition {
    /// 32 or 64; anything else places no requirement
    pub bit: Option<u8>,
}

impl OsCondition {
    pub fn new(bit: Option<u8>) -> Self {
        Self { bit }
    }

    pub fn from_attributes(attrs: &Attributes) -> Self {
        Self::new(attrs.parse("bit"))
    }

    fn is_met_on(&self, os_is_64_bit: bool) -> bool {
        match self.bit {
            Some(32) => !os_is_64_bit,
            Some(64) => os_is_64_bit,
            _ => true,
        }
    }
}

impl Predicate for OsCondition {
    fn is_met(&self, _scope: &ConditionScope<'_>) -> bool {
        self.is_met_on(is_64_bit_os())
    }
}

/// A 64-bit process implies a 64-bit OS; otherwise ask the kernel.
pub fn is_64_bit_os() -> bool {
    if cfg!(target_pointer_width = "64") {
        return true;
    }
    sysinfo::System::cpu_arch()
        .map(|arch| arch.contains("64") || arch == "s390x")
        .unwrap_or(false)
}
