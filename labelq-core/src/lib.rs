//! Domain types for labelq.
//!
//! Nothing in this crate performs I/O. The server crate owns persistence and
//! coordination; these types are shared with anything that talks to it.

pub mod item;
pub mod keys;
pub mod label;

pub use item::*;
pub use label::*;
