//! Kernel side of the node agent: loading the exec probe, decoding the records
//! it emits and the procfs/debugfs helpers the probe depends on.

mod bump_memlock_rlimit;
pub mod debugfs;
pub mod parsing;
pub mod program;

pub use bump_memlock_rlimit::bump_memlock_rlimit;
pub use program::{Program, ProgramBuilder, ProgramError};

pub use aya;
pub use nix::unistd::Pid;

/// Utility function to pretty print an error with its sources.
///
/// We use this because by default Rust won't print the source of an error message,
/// making it much less useful. Instead of re-implementing that, we'll just use
/// anyhow as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(target: &str, msg: &str, err: E) {
    log::error!(target: target, "{}: {:?}", msg, anyhow::Error::from(err));
}
