mod core;
pub mod dev_utils;
mod ops;
mod plugin;
mod schema;

pub use crate::core::*;
pub use crate::ops::*;
pub use crate::plugin::*;
pub use crate::schema::*;
