//! Built-in behaviors, wired up through [`crate::behavior::builtin_behaviors`].

pub mod logging;
pub mod transfer_monitor;
