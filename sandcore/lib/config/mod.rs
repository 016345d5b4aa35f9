//! Configuration types and helpers.

mod defaults;
mod port_range;
mod sandcore;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use port_range::*;
pub use sandcore::*;
