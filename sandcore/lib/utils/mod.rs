//! Utility functions and types.

mod env;
mod fs;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use env::*;
pub use fs::*;
