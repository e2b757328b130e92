//! Automation script execution domain logic.
//!
//! The capability surface, runner wire protocol, log collection, subprocess
//! sandbox, and result shapes. Everything here is free of storage concerns;
//! the engine crate supplies the secret store, script source loader, and
//! summarizer around these pieces.

pub mod capability;
pub mod log;
pub mod outcome;
pub mod protocol;
pub mod sandbox;
