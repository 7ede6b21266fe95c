//! Capability surfaces: filesystem, clock, subprocesses and host identity
//!
//! Production code receives these as trait objects inside [`crate::Deps`];
//! tests substitute sandboxed or scripted implementations.

pub mod atomic;
pub mod clock;
pub mod command;
pub mod fs;
pub mod host;

pub use atomic::{
    ensure_dir_all_inherit, move_file, write_file_atomic, CONFIG_MODE, DIR_MODE, PRIVATE_MODE,
};
pub use clock::{Clock, SystemClock};
pub use command::{args, CommandOutput, CommandRunner, CommandStream, OsRunner, StreamWait};
pub use fs::{join_under, FileSystem, OsFs};
pub use host::{HostInfo, OsHost};
