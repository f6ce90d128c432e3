//! Wire connection between the host and a guest's executor loop. Abstracts
//! over vsock (real VMs) vs. loopback TCP (the in-process stub driver) so
//! the pool and driver code never needs to know which one it's holding.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use shared::rpc::{RpcRequest, RpcResponse};
use shared::wire;

use crate::error::SandboxError;

/// Address a guest executor is reachable at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Vsock { cid: u32, port: u32 },
    Tcp { port: u16 },
}

/// The concrete stream kinds `HostConnection` ever wraps. A trait object
/// over a combined read+write marker trait can't carry `AsyncRead`/
/// `AsyncWrite` themselves (those aren't auto traits, so they don't survive
/// erasure), so this enum stands in for one instead.
pub enum Transport {
    Vsock(tokio_vsock::VsockStream),
    Tcp(tokio::net::TcpStream),
    Duplex(tokio::io::DuplexStream),
}

impl AsyncRead for Transport {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Vsock(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Duplex(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Vsock(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Duplex(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Vsock(s) => Pin::new(s).poll_flush(cx),
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            Transport::Duplex(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Vsock(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Duplex(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A connected channel to one guest executor, speaking the length-framed
/// request/response protocol. Construction (dialing vsock vs. TCP) is the
/// driver's job; this type only knows how to talk once connected.
pub struct HostConnection {
    stream: Transport,
}

impl HostConnection {
    pub fn new(stream: Transport) -> Self {
        HostConnection { stream }
    }

    /// Dials whichever transport `endpoint` names and wraps it. vsock
    /// connects use the guest CID/port pair; the in-process stub driver
    /// dials loopback TCP instead.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, SandboxError> {
        match *endpoint {
            Endpoint::Vsock { cid, port } => {
                let stream = tokio_vsock::VsockStream::connect(tokio_vsock::VsockAddr::new(cid, port))
                    .await
                    .map_err(|e| SandboxError::VmStartup {
                        vm_id: format!("cid-{cid}"),
                        reason: format!("connecting over vsock: {e}"),
                    })?;
                Ok(HostConnection::new(Transport::Vsock(stream)))
            }
            Endpoint::Tcp { port } => {
                let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
                    .await
                    .map_err(|e| SandboxError::VmStartup {
                        vm_id: format!("tcp-{port}"),
                        reason: format!("connecting over loopback tcp: {e}"),
                    })?;
                Ok(HostConnection::new(Transport::Tcp(stream)))
            }
        }
    }

    pub async fn send_request(&mut self, request: &RpcRequest) -> Result<(), SandboxError> {
        let payload = postcard::to_allocvec(request).map_err(shared::wire::WireError::Codec)?;
        wire::send_frame(&mut self.stream, &payload).await?;
        Ok(())
    }

    pub async fn recv_response(&mut self) -> Result<RpcResponse, SandboxError> {
        let frame = wire::recv_frame(&mut self.stream).await?;
        let response = postcard::from_bytes(&frame).map_err(shared::wire::WireError::Codec)?;
        Ok(response)
    }

    pub async fn call(&mut self, request: &RpcRequest) -> Result<RpcResponse, SandboxError> {
        self.send_request(request).await?;
        self.recv_response().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::wire::Value;

    #[tokio::test]
    async fn round_trips_a_call_over_a_duplex_pipe() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = HostConnection::new(Transport::Duplex(client));

        let request = RpcRequest::Call {
            request_id: "r1".to_string(),
            function_ref: "m:f".to_string(),
            args: vec![Value::Int(1)],
            kwargs: vec![],
            timeout_ms: 1000,
        };

        let sender = tokio::spawn(async move {
            let frame = wire::recv_frame(&mut server).await.unwrap();
            let _req: RpcRequest = postcard::from_bytes(&frame).unwrap();
            let response = RpcResponse::ok("r1".to_string(), Value::Int(2));
            let payload = postcard::to_allocvec(&response).unwrap();
            wire::send_frame(&mut server, &payload).await.unwrap();
        });

        let response = conn.call(&request).await.unwrap();
        assert_eq!(response.request_id, "r1");
        assert_eq!(response.result, Some(Value::Int(2)));

        sender.await.unwrap();
    }
}
