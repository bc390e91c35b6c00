//! Poll lifecycle: creation, vote recording, and the exactly-once
//! finalization of polls whose time window has elapsed.

pub mod command;
pub mod finalizer;
pub mod gateway;
pub mod results;
pub mod service;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testing;
