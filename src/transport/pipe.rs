//! Platform-specific local socket implementation.
//!
//! - Unix: Unix Domain Socket
//! - Windows: Named Pipe
//!
//! The host binds a listener and starts the companion process with the path;
//! the companion connects back to it.
//!
//! # Example
//!
//! ```ignore
//! use kernelwire::transport::{connect, generate_socket_path, SocketListener};
//!
//! let path = generate_socket_path();
//! let listener = SocketListener::bind(&path).await?;
//! // ...spawn the companion with `path`...
//! let stream = listener.accept().await?;
//! ```

use crate::error::Result;
use tokio::io::{AsyncRead, AsyncWrite};

/// Generate a unique socket path for this process.
///
/// Format:
/// - Unix: `/tmp/kernelwire-{pid}-{random}.sock`
/// - Windows: `\\.\pipe\kernelwire-{pid}-{random}`
pub fn generate_socket_path() -> String {
    let pid = std::process::id();
    let rand: u64 = rand_u64();

    #[cfg(unix)]
    {
        format!("/tmp/kernelwire-{}-{:x}.sock", pid, rand)
    }

    #[cfg(windows)]
    {
        format!(r"\\.\pipe\kernelwire-{}-{:x}", pid, rand)
    }
}

/// Random u64 from the clock, the process id, and a per-process counter.
fn rand_u64() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);

    let pid = std::process::id() as u64;
    (nanos ^ count.rotate_left(32)).wrapping_mul(0x517cc1b727220a95) ^ pid
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::path::Path;
    use tokio::net::{UnixListener, UnixStream};

    /// Unix Domain Socket listener. Removes its socket file on drop.
    pub struct SocketListener {
        listener: UnixListener,
        path: String,
    }

    /// Connected Unix Domain Socket.
    pub struct SocketStream {
        stream: UnixStream,
    }

    impl SocketListener {
        /// Bind to a Unix socket path.
        ///
        /// Removes any existing socket file at the path before binding.
        pub async fn bind(path: &str) -> Result<Self> {
            if Path::new(path).exists() {
                std::fs::remove_file(path)?;
            }

            let listener = UnixListener::bind(path)?;
            tracing::debug!(path, "socket listener bound");

            Ok(Self {
                listener,
                path: path.to_string(),
            })
        }

        /// Accept a single connection.
        pub async fn accept(&self) -> Result<SocketStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(SocketStream { stream })
        }

        /// Get the socket path.
        pub fn path(&self) -> &str {
            &self.path
        }
    }

    impl Drop for SocketListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    /// Connect to a listening socket.
    pub async fn connect(path: &str) -> Result<SocketStream> {
        let stream = UnixStream::connect(path).await?;
        Ok(SocketStream { stream })
    }

    impl AsyncRead for SocketStream {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.stream).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for SocketStream {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::pin::Pin::new(&mut self.stream).poll_write(cx, buf)
        }

        fn poll_write_vectored(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            bufs: &[std::io::IoSlice<'_>],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::pin::Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
        }

        fn is_write_vectored(&self) -> bool {
            self.stream.is_write_vectored()
        }

        fn poll_flush(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.stream).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.stream).poll_shutdown(cx)
        }
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use crate::error::ChannelError;
    use std::sync::Mutex;
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    /// Windows Named Pipe listener.
    pub struct SocketListener {
        path: String,
        /// First pipe instance, created at bind time to claim the name.
        first: Mutex<Option<NamedPipeServer>>,
    }

    enum Pipe {
        Server(NamedPipeServer),
        Client(NamedPipeClient),
    }

    /// Connected Named Pipe, either end.
    pub struct SocketStream {
        pipe: Pipe,
    }

    impl SocketListener {
        /// Create the Named Pipe.
        pub async fn bind(path: &str) -> Result<Self> {
            let first = ServerOptions::new()
                .first_pipe_instance(true)
                .create(path)
                .map_err(ChannelError::Io)?;
            tracing::debug!(path, "named pipe created");

            Ok(Self {
                path: path.to_string(),
                first: Mutex::new(Some(first)),
            })
        }

        /// Accept a single connection.
        pub async fn accept(&self) -> Result<SocketStream> {
            let first = self
                .first
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            let server = match first {
                Some(server) => server,
                None => ServerOptions::new()
                    .first_pipe_instance(false)
                    .create(&self.path)
                    .map_err(ChannelError::Io)?,
            };

            server.connect().await?;

            Ok(SocketStream {
                pipe: Pipe::Server(server),
            })
        }

        /// Get the pipe path.
        pub fn path(&self) -> &str {
            &self.path
        }
    }

    /// Connect to a listening Named Pipe.
    pub async fn connect(path: &str) -> Result<SocketStream> {
        let client = ClientOptions::new().open(path).map_err(ChannelError::Io)?;
        Ok(SocketStream {
            pipe: Pipe::Client(client),
        })
    }

    impl AsyncRead for SocketStream {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            match &mut self.pipe {
                Pipe::Server(pipe) => std::pin::Pin::new(pipe).poll_read(cx, buf),
                Pipe::Client(pipe) => std::pin::Pin::new(pipe).poll_read(cx, buf),
            }
        }
    }

    impl AsyncWrite for SocketStream {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            match &mut self.pipe {
                Pipe::Server(pipe) => std::pin::Pin::new(pipe).poll_write(cx, buf),
                Pipe::Client(pipe) => std::pin::Pin::new(pipe).poll_write(cx, buf),
            }
        }

        fn poll_flush(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            match &mut self.pipe {
                Pipe::Server(pipe) => std::pin::Pin::new(pipe).poll_flush(cx),
                Pipe::Client(pipe) => std::pin::Pin::new(pipe).poll_flush(cx),
            }
        }

        fn poll_shutdown(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            match &mut self.pipe {
                Pipe::Server(pipe) => std::pin::Pin::new(pipe).poll_shutdown(cx),
                Pipe::Client(pipe) => std::pin::Pin::new(pipe).poll_shutdown(cx),
            }
        }
    }
}

// ============================================================================
// Platform-independent re-exports
// ============================================================================

#[cfg(unix)]
pub use unix_impl::{connect, SocketListener, SocketStream};

#[cfg(windows)]
pub use windows_impl::{connect, SocketListener, SocketStream};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_socket_path_format() {
        let path = generate_socket_path();

        #[cfg(unix)]
        {
            assert!(path.starts_with("/tmp/kernelwire-"));
            assert!(path.ends_with(".sock"));
        }

        #[cfg(windows)]
        {
            assert!(path.starts_with(r"\\.\pipe\kernelwire-"));
        }
    }

    #[test]
    fn test_generate_socket_path_uniqueness() {
        let paths: std::collections::HashSet<String> =
            (0..10).map(|_| generate_socket_path()).collect();
        assert_eq!(paths.len(), 10);
    }

    #[test]
    fn test_socket_path_contains_pid() {
        let path = generate_socket_path();
        let pid = std::process::id().to_string();
        assert!(path.contains(&pid), "Path should contain PID");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bind_accept_connect() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let path = generate_socket_path();
        let listener = SocketListener::bind(&path).await.unwrap();

        let (accepted, connected) = tokio::join!(listener.accept(), connect(&path));
        let mut accepted = accepted.unwrap();
        let mut connected = connected.unwrap();

        connected.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(listener);
        assert!(!std::path::Path::new(&path).exists());
    }
}
