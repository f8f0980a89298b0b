//! Restricted editing exceptions: a toggleable text attribute marking the
//! parts of a document that stay editable.

pub mod attribute;
mod command;
mod config;
mod plugin;

pub use crate::attribute::{
    AttributeChange, AttributeMutation, Slice, SliceKind, ToggleContext, TogglePlan,
    exception_ranges,
};
pub use crate::command::*;
pub use crate::config::*;
pub use crate::plugin::*;
