//! IPC command handlers, one submodule per RPC category.

pub mod diagnostics;
pub mod groups;
pub mod identity;
pub mod messaging;
pub mod network;
