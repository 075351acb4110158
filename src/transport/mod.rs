//! Transport module - local socket connection to the companion process.
//!
//! Provides abstraction over:
//! - Unix Domain Sockets (Linux/macOS)
//! - Named Pipes (Windows)

mod pipe;

pub use pipe::{connect, generate_socket_path, SocketListener, SocketStream};
