pub mod fleet;
pub mod keys;

pub use fleet::{FakeFleet, FakeHost};
