//! Utilities shared by the squall binaries.

pub mod config;
pub mod ext;
pub mod log;
pub mod net;
pub mod signal;
pub mod sync;
