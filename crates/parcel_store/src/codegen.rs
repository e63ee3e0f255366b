//! Pickup code generation.

use rand::rngs::OsRng;
use rand::Rng;

use parcel_common::item::PickupCode;

/// Source of candidate pickup codes. Uniqueness is enforced by the store,
/// not here.
pub trait CodeSource: Send + Sync {
    fn generate(&self) -> PickupCode;
}

/// Fixed-length decimal codes drawn from the OS CSPRNG. Leading zeros are
/// kept, so every code has exactly `length` digits.
#[derive(Debug, Clone)]
pub struct CodeGenerator {
    length: usize,
}

impl CodeGenerator {
    pub fn new(length: usize) -> Self {
        Self {
            length: length.max(1),
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new(6)
    }
}

impl CodeSource for CodeGenerator {
    fn generate(&self) -> PickupCode {
        let mut rng = OsRng;
        let code: String = (0..self.length)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect();
        PickupCode::new(code)
    }
}
