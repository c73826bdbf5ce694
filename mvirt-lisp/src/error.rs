//! Error types for mvirt-lisp.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::scheduler::SchedulerError;
use crate::wire::WireError;

/// Main error type for daemon setup and I/O.
///
/// Only the fatal class (reactor, bridge, TUN, privilege) ever reaches `main`;
/// everything else is logged where it happens.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("System error: {0}")]
    Nix(#[from] nix::errno::Errno),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Signal bridge already installed in this process")]
    BridgeInUse,

    #[error("Multiplexer failure: {0}")]
    Reactor(nix::errno::Errno),

    #[error("Unexpected signal {0}")]
    UnexpectedSignal(i32),

    #[error("TUN device closed")]
    TunClosed,

    #[error("Running mvirt-lisp requires superuser privileges")]
    NotRoot,
}

pub type Result<T> = std::result::Result<T, Error>;
