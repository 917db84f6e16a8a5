// Idempotent, atomically committed units of work

pub mod envelope;
pub mod idempotent;
pub mod salt;

pub use idempotent::{execute_idempotent, IdempotentUnit, UnitOutcome, UnitRun};
pub use salt::{RunSalts, Salt};
