//! `sandutils` is a library containing general utilities for the sandcore project.

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod error;
pub mod id;
pub mod path;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use error::*;
pub use id::*;
pub use path::*;
