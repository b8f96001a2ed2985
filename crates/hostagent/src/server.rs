//! Agent server: newline-delimited JSON over the local transport.
//!
//! Unary requests get exactly one response frame. `wait` and `keep_alive`
//! turn the connection into a stream; a keep-alive connection is consumed by
//! its session and closed afterwards.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::StreamExt;
use hostagent_protocol::{
    AgentRequest, AgentResponse, ErrorCode, ExitedResponse, KeepAliveRequest, KilledResponse,
    MountedResponse, OutputChunk, StartedResponse,
};
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::SupervisorError;
use crate::service::AgentService;
use crate::supervisor::WaitEvent;
use crate::transport::Listener;

fn error_response(err: &SupervisorError) -> AgentResponse {
    AgentResponse::error(err.code(), err.to_string())
}

async fn write_frame<W>(writer: &mut W, response: &AgentResponse) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(response).map_err(std::io::Error::other)?;
    writer.write_all(format!("{json}\n").as_bytes()).await?;
    writer.flush().await
}

/// Request log line with a level picked from the outcome.
fn log_request(method: &str, code: Option<ErrorCode>, cost: Duration, message: Option<&str>) {
    let level = match code {
        None => log::Level::Debug,
        Some(ErrorCode::NotFound | ErrorCode::InvalidArgument | ErrorCode::AlreadyRunning) => {
            log::Level::Info
        }
        Some(ErrorCode::IntegrityMismatch) => log::Level::Warn,
        Some(ErrorCode::Internal | ErrorCode::Unknown) => log::Level::Error,
    };
    let status = code.map_or("ok", |c| c.as_str());
    match message {
        Some(message) => log::log!(level, "[RPC] {method} {{ {status} }}, cost {cost:?}: {message}"),
        None => log::log!(level, "[RPC] {method} {{ {status} }}, cost {cost:?}"),
    }
}

/// How a keep-alive session ended on the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// `keep_alive_close` received.
    Closed,
    /// EOF or read error.
    Dropped,
}

pub struct AgentServer {
    service: Arc<AgentService>,
    connections: AtomicU64,
}

impl AgentServer {
    pub fn new(service: Arc<AgentService>) -> Self {
        Self {
            service,
            connections: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> &Arc<AgentService> {
        &self.service
    }

    /// Accept connections until `shutdown` fires.
    ///
    /// Managed processes are left running on shutdown; the next agent picks
    /// them up as stale processes.
    pub async fn serve(
        self: Arc<Self>,
        mut listener: Listener,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        info!("Agent listening on {}", listener.endpoint());

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok(stream) => {
                            let id = self.connections.fetch_add(1, Ordering::Relaxed);
                            debug!("New client connection");
                            let server = Arc::clone(&self);
                            tokio::spawn(
                                async move { server.handle_connection(stream).await }
                                    .instrument(tracing::info_span!("connection", id)),
                            );
                        }
                        Err(e) => {
                            error!("Accept error: {e}");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        let remaining = self.service.supervisor().registry().names();
        if !remaining.is_empty() {
            info!("Leaving managed processes running: {}", remaining.join(", "));
        }
        listener.close().await;
        Ok(())
    }

    /// Serve one client until it disconnects.
    pub async fn handle_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("Client disconnected");
                    break;
                }
                Ok(_) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let request: AgentRequest = match serde_json::from_str(&line) {
                        Ok(r) => r,
                        Err(e) => {
                            let resp = AgentResponse::error(
                                ErrorCode::InvalidArgument,
                                format!("Invalid JSON: {e}"),
                            );
                            if write_frame(&mut writer, &resp).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    };

                    let method = request.method();
                    let started = Instant::now();
                    match request {
                        AgentRequest::Wait(wait) => {
                            match self.stream_wait(wait, &mut writer).await {
                                Ok(err) => log_request(
                                    method,
                                    err.as_ref().map(|e| e.code),
                                    started.elapsed(),
                                    err.as_ref().map(|e| e.message.as_str()),
                                ),
                                Err(e) => {
                                    debug!("Wait client went away: {e}");
                                    break;
                                }
                            }
                        }
                        AgentRequest::KeepAlive(first) => {
                            self.keep_alive_session(first, &mut reader, &mut writer, started)
                                .await;
                            break;
                        }
                        other => {
                            let resp = self.handle_request(other, &cancel).await;
                            match &resp {
                                AgentResponse::Error(e) => log_request(
                                    method,
                                    Some(e.code),
                                    started.elapsed(),
                                    Some(&e.message),
                                ),
                                _ => log_request(method, None, started.elapsed(), None),
                            }
                            if write_frame(&mut writer, &resp).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!("Read error: {e}");
                    break;
                }
            }
        }
    }

    async fn handle_request(
        &self,
        request: AgentRequest,
        cancel: &CancellationToken,
    ) -> AgentResponse {
        match request {
            AgentRequest::Start(start) => match self.service.start(start, cancel).await {
                Ok(process_name) => AgentResponse::Started(StartedResponse { process_name }),
                Err(e) => error_response(&e),
            },
            AgentRequest::Kill(kill) => match self.service.kill(kill).await {
                Ok(process_name) => AgentResponse::Killed(KilledResponse { process_name }),
                Err(e) => error_response(&e),
            },
            AgentRequest::Mount(mount) => match self.service.mount(mount).await {
                Ok(destinations) => AgentResponse::Mounted(MountedResponse { destinations }),
                Err(e) => error_response(&e),
            },
            AgentRequest::Version => AgentResponse::Version(self.service.version()),
            AgentRequest::Ping => AgentResponse::Pong,
            AgentRequest::KeepAliveClose => AgentResponse::error(
                ErrorCode::InvalidArgument,
                "keep_alive_close outside of a keep-alive session",
            ),
            AgentRequest::Wait(_) | AgentRequest::KeepAlive(_) => AgentResponse::error(
                ErrorCode::InvalidArgument,
                "streaming request routed as unary",
            ),
        }
    }

    /// Forward a wait stream to the client. Returns the error frame sent, if
    /// the stream failed.
    async fn stream_wait<W>(
        &self,
        request: hostagent_protocol::WaitRequest,
        writer: &mut W,
    ) -> std::io::Result<Option<hostagent_protocol::ErrorResponse>>
    where
        W: AsyncWrite + Unpin,
    {
        let mut stream = match self.service.wait(request).await {
            Ok(stream) => stream,
            Err(e) => {
                let resp = error_response(&e);
                write_frame(writer, &resp).await?;
                return Ok(into_error(resp));
            }
        };

        while let Some(item) = stream.next().await {
            let resp = match item {
                Ok(WaitEvent::Stdout(data)) => AgentResponse::Stdout(OutputChunk::from_bytes(&data)),
                Ok(WaitEvent::Stderr(data)) => AgentResponse::Stderr(OutputChunk::from_bytes(&data)),
                Ok(WaitEvent::Exited(exit_code)) => {
                    AgentResponse::Exited(ExitedResponse { exit_code })
                }
                Err(e) => error_response(&e),
            };
            write_frame(writer, &resp).await?;
            if resp.is_terminal() {
                return Ok(into_error(resp));
            }
        }

        // The producer went away without a terminal event.
        let resp = AgentResponse::error(ErrorCode::Unknown, "wait stream ended unexpectedly");
        write_frame(writer, &resp).await?;
        Ok(into_error(resp))
    }

    /// Run a keep-alive session: forward pings until the client closes the
    /// session or disconnects, then kill the process.
    async fn keep_alive_session<R, W>(
        &self,
        first: KeepAliveRequest,
        reader: &mut BufReader<R>,
        writer: &mut W,
        started: Instant,
    ) where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (tx, rx) = mpsc::channel::<KeepAliveRequest>(16);
        // Capacity is 16 and nothing has been sent yet.
        let _ = tx.try_send(first);

        let pings = async move {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => return SessionEnd::Dropped,
                    Ok(_) => match serde_json::from_str::<AgentRequest>(&line) {
                        Ok(AgentRequest::KeepAlive(ping)) => {
                            if tx.send(ping).await.is_err() {
                                return SessionEnd::Dropped;
                            }
                        }
                        Ok(AgentRequest::KeepAliveClose) => return SessionEnd::Closed,
                        Ok(other) => {
                            warn!("Ignoring {} inside a keep-alive session", other.method());
                        }
                        Err(e) => warn!("Ignoring malformed keep-alive frame: {e}"),
                    },
                    Err(e) => {
                        debug!("Keep-alive read error: {e}");
                        return SessionEnd::Dropped;
                    }
                }
            }
        };
        let session = self.service.keep_alive(ReceiverStream::new(rx));
        tokio::pin!(pings);
        tokio::pin!(session);

        let (end, result) = tokio::select! {
            result = &mut session => (None, result),
            end = &mut pings => (Some(end), session.await),
        };

        let resp = match &result {
            Ok(()) => AgentResponse::KeepAliveAck,
            Err(e) => error_response(e),
        };
        match &resp {
            AgentResponse::Error(e) => {
                log_request("keep_alive", Some(e.code), started.elapsed(), Some(&e.message))
            }
            _ => log_request("keep_alive", None, started.elapsed(), None),
        }

        // A dropped client has nobody to answer.
        if end != Some(SessionEnd::Dropped) {
            let _ = write_frame(writer, &resp).await;
        }
    }
}

fn into_error(resp: AgentResponse) -> Option<hostagent_protocol::ErrorResponse> {
    match resp {
        AgentResponse::Error(e) => Some(e),
        _ => None,
    }
}
