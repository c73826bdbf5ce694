//! LISP edge router / mobile node daemon core.
//!
//! A single-threaded event loop multiplexes the tun device, the LISP control
//! socket, the LISP data socket and a signal-driven timer bridge, and drives
//! the map-cache protocol (map-register, map-request / map-reply).

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod eid;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod scheduler;
pub mod signal;
pub mod store;
pub mod tun;
pub mod wire;

pub use error::{Error, Result};
