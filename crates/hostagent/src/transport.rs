//! Local stream transport: a named pipe on Windows, a Unix domain socket
//! everywhere else.

use std::io;
#[cfg(unix)]
use std::path::PathBuf;

use log::debug;
#[cfg(windows)]
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Stream handed to the connection handler for each accepted client.
#[cfg(unix)]
pub type ServerStream = UnixStream;
#[cfg(windows)]
pub type ServerStream = NamedPipeServer;

/// Stream a client talks to the agent over.
#[cfg(unix)]
pub type ClientStream = UnixStream;
#[cfg(windows)]
pub type ClientStream = NamedPipeClient;

/// Default listen endpoint for this platform.
pub fn default_endpoint() -> String {
    #[cfg(windows)]
    {
        r"\\.\pipe\hostagent".to_string()
    }
    #[cfg(not(windows))]
    {
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("hostagent.sock")
            .to_string_lossy()
            .into_owned()
    }
}

#[cfg(unix)]
pub struct Listener {
    path: PathBuf,
    listener: UnixListener,
}

#[cfg(unix)]
impl Listener {
    /// Bind `endpoint`, replacing a leftover socket file.
    pub async fn bind(endpoint: &str) -> io::Result<Self> {
        let path = PathBuf::from(endpoint);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _ = tokio::fs::remove_file(&path).await;
        let listener = UnixListener::bind(&path)?;
        Ok(Self { path, listener })
    }

    pub async fn accept(&mut self) -> io::Result<ServerStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn endpoint(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub async fn close(self) {
        drop(self.listener);
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

#[cfg(windows)]
pub struct Listener {
    name: String,
    server: NamedPipeServer,
}

#[cfg(windows)]
impl Listener {
    pub async fn bind(endpoint: &str) -> io::Result<Self> {
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .reject_remote_clients(true)
            .create(endpoint)?;
        Ok(Self {
            name: endpoint.to_string(),
            server,
        })
    }

    /// Wait for a client on the current pipe instance, then put a fresh
    /// instance in its place for the next client.
    pub async fn accept(&mut self) -> io::Result<ServerStream> {
        self.server.connect().await?;
        let next = ServerOptions::new()
            .reject_remote_clients(true)
            .create(&self.name)?;
        Ok(std::mem::replace(&mut self.server, next))
    }

    pub fn endpoint(&self) -> String {
        self.name.clone()
    }

    pub async fn close(self) {}
}

/// Connect to the agent listening on `endpoint`.
#[cfg(unix)]
pub async fn connect(endpoint: &str) -> io::Result<ClientStream> {
    UnixStream::connect(endpoint).await
}

/// Connect to the agent listening on `endpoint`.
#[cfg(windows)]
pub async fn connect(endpoint: &str) -> io::Result<ClientStream> {
    const ERROR_PIPE_BUSY: i32 = 231;
    let mut attempts = 0;
    loop {
        match ClientOptions::new().open(endpoint) {
            Ok(client) => return Ok(client),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) && attempts < 50 => {
                attempts += 1;
                debug!("pipe {endpoint} busy, retrying");
            }
            Err(e) => return Err(e),
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bind_accept_connect() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("agent.sock").to_string_lossy().into_owned();
        let mut listener = Listener::bind(&endpoint).await.unwrap();

        let client = tokio::spawn({
            let endpoint = endpoint.clone();
            async move {
                let mut stream = connect(&endpoint).await.unwrap();
                stream.write_all(b"hi").await.unwrap();
            }
        });

        let mut server = listener.accept().await.unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        client.await.unwrap();

        listener.close().await;
        assert!(!std::path::Path::new(&endpoint).exists());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("agent.sock").to_string_lossy().into_owned();
        std::fs::write(&endpoint, b"").unwrap();
        let listener = Listener::bind(&endpoint).await.unwrap();
        assert_eq!(listener.endpoint(), endpoint);
    }
}
