//! Data model for the playbook / target / command domain (spec §3).
//!
//! This crate holds plain, serde-driven types and no execution logic: the
//! loader, resolver, preparer, executor and runner (the `spot` binary crate)
//! build on top of these shapes but own all behavior.

pub mod command;
pub mod playbook;
pub mod secrets;
pub mod target;

pub use command::{Action, CmdOptions, Command, CommandValidationError, CopySpec, DeleteSpec, LineSpec, SyncSpec, WaitSpec};
pub use playbook::{Playbook, SimplePlaybook, Task};
pub use secrets::{SecretsError, SecretsProvider};
pub use target::{Destination, InventoryData, Overrides, Target, RESERVED_ALL};
