//! Utils

pub mod hash;
pub mod prime;
pub mod spin;
