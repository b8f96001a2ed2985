//! Client for the agent.
//!
//! One connection per call for unary requests; wait and keep-alive each hold
//! their own connection for as long as they run.

use anyhow::{Context, Result};
use hostagent_protocol::{
    AgentRequest, AgentResponse, ErrorCode, KeepAliveRequest, KillRequest, MountRequest,
    StartRequest, VersionResponse, VolumePath, WaitRequest,
};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf};

use crate::supervisor::WaitEvent;
use crate::transport::{self, ClientStream};

/// Error frame returned by the agent.
#[derive(Debug, Clone, thiserror::Error)]
#[error("agent error ({code}): {message}")]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

/// Error code of a failed call, if the agent produced one.
pub fn remote_code(err: &anyhow::Error) -> Option<ErrorCode> {
    err.downcast_ref::<RemoteError>().map(|e| e.code)
}

async fn send<W>(writer: &mut W, request: &AgentRequest) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut json = serde_json::to_string(request).context("serializing request")?;
    json.push('\n');
    writer
        .write_all(json.as_bytes())
        .await
        .context("writing request")?;
    writer.flush().await.context("flushing request")
}

fn check(resp: AgentResponse) -> Result<AgentResponse> {
    if let AgentResponse::Error(e) = resp {
        return Err(RemoteError {
            code: e.code,
            message: e.message,
        }
        .into());
    }
    Ok(resp)
}

type FrameLines = Lines<BufReader<ReadHalf<ClientStream>>>;

async fn next_frame(lines: &mut FrameLines) -> Result<Option<AgentResponse>> {
    match lines.next_line().await.context("reading response")? {
        Some(line) => Ok(Some(
            serde_json::from_str(&line).context("parsing response")?,
        )),
        None => Ok(None),
    }
}

#[derive(Clone)]
pub struct AgentClient {
    endpoint: String,
}

impl AgentClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn open(&self) -> Result<(FrameLines, WriteHalf<ClientStream>)> {
        let stream = transport::connect(&self.endpoint)
            .await
            .with_context(|| format!("connecting to agent at {}", self.endpoint))?;
        let (reader, writer) = tokio::io::split(stream);
        Ok((BufReader::new(reader).lines(), writer))
    }

    /// Send a request and receive a response.
    async fn request(&self, req: &AgentRequest) -> Result<AgentResponse> {
        let (mut lines, mut writer) = self.open().await?;
        send(&mut writer, req).await?;
        let resp = next_frame(&mut lines)
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection closed"))?;
        check(resp)
    }

    /// Start a binary and return its process name.
    pub async fn start(&self, request: StartRequest) -> Result<String> {
        match self.request(&AgentRequest::Start(request)).await? {
            AgentResponse::Started(s) => Ok(s.process_name),
            _ => anyhow::bail!("unexpected response to start"),
        }
    }

    pub async fn kill(&self, process_name: impl Into<String>) -> Result<()> {
        let req = AgentRequest::Kill(KillRequest {
            process_name: process_name.into(),
        });
        match self.request(&req).await? {
            AgentResponse::Killed(_) => Ok(()),
            _ => anyhow::bail!("unexpected response to kill"),
        }
    }

    /// Link container paths onto the host. Returns the host paths linked.
    pub async fn mount(
        &self,
        selectors: Vec<String>,
        paths: Vec<VolumePath>,
    ) -> Result<Vec<String>> {
        let req = AgentRequest::Mount(MountRequest { selectors, paths });
        match self.request(&req).await? {
            AgentResponse::Mounted(m) => Ok(m.destinations),
            _ => anyhow::bail!("unexpected response to mount"),
        }
    }

    pub async fn version(&self) -> Result<VersionResponse> {
        match self.request(&AgentRequest::Version).await? {
            AgentResponse::Version(v) => Ok(v),
            _ => anyhow::bail!("unexpected response to version"),
        }
    }

    /// Check if the agent is alive.
    pub async fn ping(&self) -> Result<bool> {
        match self.request(&AgentRequest::Ping).await {
            Ok(AgentResponse::Pong) => Ok(true),
            Ok(_) => Ok(false),
            Err(_) => Ok(false),
        }
    }

    /// Open a wait stream for `process_name`.
    pub async fn wait(&self, process_name: impl Into<String>) -> Result<WaitSubscription> {
        let process_name = process_name.into();
        let (lines, mut writer) = self.open().await?;
        send(
            &mut writer,
            &AgentRequest::Wait(WaitRequest {
                process_name: process_name.clone(),
            }),
        )
        .await?;
        Ok(WaitSubscription {
            process_name,
            lines,
            _writer: writer,
            done: false,
        })
    }

    /// Open a keep-alive session for `process_name`. The process is killed
    /// when the session is closed or dropped.
    pub async fn keep_alive(&self, process_name: impl Into<String>) -> Result<KeepAliveSession> {
        let process_name = process_name.into();
        let (lines, writer) = self.open().await?;
        let mut session = KeepAliveSession {
            process_name,
            lines,
            writer,
        };
        session.ping().await?;
        Ok(session)
    }
}

/// An open wait stream.
pub struct WaitSubscription {
    process_name: String,
    lines: FrameLines,
    // Keep writer alive to maintain connection
    _writer: WriteHalf<ClientStream>,
    done: bool,
}

impl WaitSubscription {
    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    /// Next output event. `Ok(None)` after the exit event.
    pub async fn next(&mut self) -> Result<Option<WaitEvent>> {
        if self.done {
            return Ok(None);
        }
        let Some(resp) = next_frame(&mut self.lines).await? else {
            self.done = true;
            anyhow::bail!("connection closed before {} exited", self.process_name);
        };
        match check(resp) {
            Ok(AgentResponse::Stdout(chunk)) => Ok(Some(WaitEvent::Stdout(
                chunk.to_bytes().context("decoding stdout")?,
            ))),
            Ok(AgentResponse::Stderr(chunk)) => Ok(Some(WaitEvent::Stderr(
                chunk.to_bytes().context("decoding stderr")?,
            ))),
            Ok(AgentResponse::Exited(e)) => {
                self.done = true;
                Ok(Some(WaitEvent::Exited(e.exit_code)))
            }
            Ok(_) => anyhow::bail!("unexpected response in wait stream"),
            Err(e) => {
                self.done = true;
                Err(e)
            }
        }
    }
}

/// An open keep-alive session.
pub struct KeepAliveSession {
    process_name: String,
    lines: FrameLines,
    writer: WriteHalf<ClientStream>,
}

impl KeepAliveSession {
    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    /// Refresh the agent's idle timer.
    pub async fn ping(&mut self) -> Result<()> {
        let req = AgentRequest::KeepAlive(KeepAliveRequest {
            process_name: self.process_name.clone(),
        });
        send(&mut self.writer, &req).await
    }

    /// End the session; the agent kills the process before acknowledging.
    pub async fn close(mut self) -> Result<()> {
        send(&mut self.writer, &AgentRequest::KeepAliveClose).await?;
        let resp = next_frame(&mut self.lines)
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection closed before keep-alive ack"))?;
        match check(resp)? {
            AgentResponse::KeepAliveAck => Ok(()),
            _ => anyhow::bail!("unexpected response to keep_alive_close"),
        }
    }
}
