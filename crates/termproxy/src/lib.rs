//! Share one terminal program with any number of viewers over mutually
//! authenticated TLS.
//!
//! The server runs a program on a PTY. The operator's terminal and every
//! attached viewer see the same output, and anything typed by any of them
//! reaches the program.

pub mod buffer;
pub mod client;
pub mod config;
pub mod console;
pub mod error;
pub mod framing;
pub mod logging;
pub mod mux;
pub mod pty;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod tls;
pub mod transport;

pub use error::{ProxyError, Result};
pub use pty::{CommandSpec, WindowSize};
pub use session::{Session, SessionEnd};
