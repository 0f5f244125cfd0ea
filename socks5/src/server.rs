use std::net::SocketAddr;

use bytes::BytesMut;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::proto::*;
use crate::{Error, ProtocolError, Result};

/// Runs the negotiation on `stream` up to the point where the request must be
/// answered. The caller executes the command and replies through the returned
/// `TcpIncoming`.
pub async fn accept<S>(stream: S) -> Result<TcpIncoming<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let acceptor = Acceptor::new(stream);
    acceptor.accept().await
}

pub struct TcpIncoming<S> {
    acceptor: Acceptor<S>,
    method: AuthMethod,
    command: Command,
    destination: Endpoint,
}

impl<S> TcpIncoming<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn method(&self) -> AuthMethod {
        self.method
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn destination(&self) -> &Endpoint {
        &self.destination
    }

    pub fn state(&self) -> NegotiationState {
        self.acceptor.state
    }

    pub fn stream(&self) -> &S {
        &self.acceptor.stream
    }

    /// Sends the success reply and gives back the stream together with any
    /// bytes the client already sent past the request.
    pub async fn reply_ok(mut self, bind: SocketAddr) -> Result<(S, BytesMut)> {
        self.acceptor.reply(ReplyStatus::Granted, Some(bind)).await?;
        Ok((self.acceptor.stream, self.acceptor.buf))
    }

    pub async fn reply_err(mut self, status: ReplyStatus) -> Result<()> {
        self.acceptor.reply(status, None).await?;
        self.acceptor.stream.shutdown().await?;
        Ok(())
    }
}

struct Acceptor<S> {
    stream: S,
    buf: BytesMut,
    state: NegotiationState,
}

impl<S> Acceptor<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(512),
            state: NegotiationState::Greeting,
        }
    }

    async fn accept(mut self) -> Result<TcpIncoming<S>> {
        let method = self.select_method().await?;

        let Request {
            command,
            destination,
        } = match self.read_until(decode_request).await {
            Ok(request) => request,
            Err(Error::Protocol(e)) => {
                let _ = self.reply(e.reply_status(), None).await;
                let _ = self.stream.shutdown().await;
                return Err(e.into());
            }
            Err(e) => return Err(e),
        };

        self.state = self.state.next();
        debug!("socks5: {:?} {} ({:?})", command, destination, method);

        Ok(TcpIncoming {
            acceptor: self,
            method,
            command,
            destination,
        })
    }

    async fn select_method(&mut self) -> Result<AuthMethod> {
        let methods = self.read_until(decode_greeting).await?;

        let Some(method) = select_method(&methods, SUPPORTED_METHODS) else {
            let reply = encode_method(AuthMethod::NoAcceptableMethods);
            self.stream.write_all(&reply).await?;
            let _ = self.stream.shutdown().await;
            return Err(Error::NoAcceptableMethods);
        };

        self.stream.write_all(&encode_method(method)).await?;
        self.state = self.state.next();
        Ok(method)
    }

    /// Reads until `decode` can take a whole frame off the buffer.
    async fn read_until<T>(
        &mut self,
        decode: fn(&mut BytesMut) -> std::result::Result<Option<T>, ProtocolError>,
    ) -> Result<T> {
        loop {
            if let Some(value) = decode(&mut self.buf)? {
                return Ok(value);
            }

            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(Error::Closed);
            }
        }
    }

    async fn reply(&mut self, status: ReplyStatus, bind: Option<SocketAddr>) -> Result<()> {
        let reply = encode_reply(status, bind);
        self.stream.write_all(&reply).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
