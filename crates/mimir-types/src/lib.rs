//! # mimir-types
//!
//! Shared domain types and collaborator traits for the Mimir protocol
//! stack. Every structure here corresponds to Section 3 of the protocol
//! specification; every trait corresponds to a named collaborator in
//! Section 6 or a capability interface in Section 9.
//!
//! This crate has no network or storage code of its own — it is the seam
//! the rest of the workspace is built around.

pub mod model;
pub mod traits;

pub use model::*;
pub use traits::*;
