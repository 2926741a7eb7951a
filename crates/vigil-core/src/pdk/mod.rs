//! Plumbing shared by the agent modules: typed access to the INI configuration
//! sections and the cancellation signal every long-running loop listens to.

mod config;
mod shutdown;

pub use config::*;
pub use shutdown::*;

/// Name a module logs under. Passed to every component at construction.
pub type ModuleName = &'static str;
