//! The framed control connection to the rendezvous server.

use tokio::net::TcpStream;

use burrow_core::codec::{read_frame, write_frame};
use burrow_core::error::{BurrowError, BurrowResult};
use burrow_core::messages::{ControlRequest, ControlResponse};

/// One control connection. A dial failure is classified as
/// [`BurrowError::Unavailable`] so callers can tell "server down, retry"
/// apart from everything else.
pub struct ControlStream {
    stream: TcpStream,
}

impl ControlStream {
    pub async fn connect(addr: &str) -> BurrowResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| BurrowError::Unavailable(format!("{addr}: {e}")))?;
        Ok(Self { stream })
    }

    pub async fn send(&mut self, request: &ControlRequest) -> BurrowResult<()> {
        write_frame(&mut self.stream, request).await
    }

    /// Next response frame; `None` when the server closed the stream.
    pub async fn next(&mut self) -> BurrowResult<Option<ControlResponse>> {
        read_frame(&mut self.stream).await
    }
}

/// One-shot request/response against the control API.
pub async fn call(addr: &str, request: &ControlRequest) -> BurrowResult<ControlResponse> {
    let mut control = ControlStream::connect(addr).await?;
    control.send(request).await?;
    control
        .next()
        .await?
        .ok_or_else(|| BurrowError::Channel("server closed the stream without responding".into()))
}
