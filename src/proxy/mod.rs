pub mod http;

use std::io::{self, Result};
use std::time::Duration;

use futures::stream::StreamExt;
use self::http::{HttpProxy, Response};
use log::{debug, error, info, warn};
use socks5::{Command, ReplyStatus, TcpIncoming};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;

use crate::establish::{ConnectError, Establisher};
use crate::relay::BidirectionalRelay;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub async fn run_socks5_proxy(listen: &str, establisher: Establisher) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!("SOCKS5 listening on {}", listener.local_addr()?);
    serve_socks5(listener, establisher).await;
    Ok(())
}

pub async fn run_http_proxy(listen: &str, establisher: Establisher) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!("HTTP listening on {}", listener.local_addr()?);
    serve_http(listener, establisher).await;
    Ok(())
}

/// Accepts SOCKS5 clients on `listener` forever, one task per connection.
pub async fn serve_socks5(listener: TcpListener, establisher: Establisher) {
    let mut incoming = TcpListenerStream::new(listener);

    while let Some(stream) = incoming.next().await {
        match stream {
            Ok(stream) => {
                let establisher = establisher.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_socks5_proxy_connection(stream, establisher).await {
                        debug!("socks5 connection: {}", e);
                    }
                });
            }
            Err(e) => accept_failed("socks5", e).await,
        }
    }
}

/// Accepts HTTP CONNECT clients on `listener` forever, one task per
/// connection.
pub async fn serve_http(listener: TcpListener, establisher: Establisher) {
    let mut incoming = TcpListenerStream::new(listener);

    while let Some(stream) = incoming.next().await {
        match stream {
            Ok(stream) => {
                let establisher = establisher.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_http_proxy_connection(stream, establisher).await {
                        debug!("http connection: {}", e);
                    }
                });
            }
            Err(e) => accept_failed("http", e).await,
        }
    }
}

async fn run_socks5_proxy_connection(stream: TcpStream, establisher: Establisher) -> Result<()> {
    let incoming = socks5::accept(stream).await?;

    match incoming.command() {
        Command::Connect => run_socks5_connect(incoming, establisher).await,
        Command::Bind | Command::UdpAssociate => {
            debug!("socks5: {:?} not supported", incoming.command());
            incoming.reply_err(ReplyStatus::CommandNotSupported).await?;
            Ok(())
        }
    }
}

async fn run_socks5_connect(
    incoming: TcpIncoming<TcpStream>,
    establisher: Establisher,
) -> Result<()> {
    let outbound = tokio::select! {
        r = establisher.connect(incoming.destination()) => r,
        _ = client_closed(incoming.stream()) => {
            debug!("socks5: client left before {} was reached", incoming.destination());
            return Ok(());
        }
    };

    let outbound = match outbound {
        Ok(outbound) => outbound,
        Err(e) => {
            log_connect_error(&e);
            incoming.reply_err(e.reply_status()).await?;
            return Ok(());
        }
    };

    let bind = outbound.local_addr()?;
    info!("Tunnel {} -> {} via {}", peer(incoming.stream()), incoming.destination(), bind);

    let (inbound, pending) = incoming.reply_ok(bind).await?;
    BidirectionalRelay::new(inbound, outbound)
        .with_pending(pending)
        .run()
        .await
        .map(|_| ())
}

async fn run_http_proxy_connection(stream: TcpStream, establisher: Establisher) -> Result<()> {
    let incoming = match HttpProxy::accept(stream).await {
        Ok(incoming) => incoming,
        Err(e) => {
            debug!("http: {}", e);
            return Ok(());
        }
    };

    if !incoming.request().is_connect() {
        debug!("http: {} not allowed", incoming.request().method);
        return incoming.respond_err(Response::MethodNotAllowed).await;
    }

    let endpoint = match incoming.request().connect_endpoint() {
        Ok(endpoint) => endpoint,
        Err(e) => {
            debug!("{}", e);
            return incoming.respond_err(Response::InternalServerError).await;
        }
    };

    let outbound = tokio::select! {
        r = establisher.connect(&endpoint) => r,
        _ = client_closed(incoming.stream()) => {
            debug!("http: client left before {} was reached", endpoint);
            return Ok(());
        }
    };

    let outbound = match outbound {
        Ok(outbound) => outbound,
        Err(e) => {
            log_connect_error(&e);
            return incoming.respond_err(Response::InternalServerError).await;
        }
    };

    info!(
        "Tunnel {} -> {} via {}",
        peer(incoming.stream()),
        endpoint,
        outbound.local_addr()?
    );

    let (inbound, pending) = incoming.respond_ok().await?;
    BidirectionalRelay::new(inbound, outbound)
        .with_pending(pending)
        .run()
        .await
        .map(|_| ())
}

/// Resolves once the client has closed its side while we are still
/// connecting. If the client already sent more data it is kept for the relay
/// and this never resolves.
async fn client_closed(stream: &TcpStream) {
    let mut byte = [0u8; 1];
    match stream.peek(&mut byte).await {
        Ok(0) | Err(_) => {}
        Ok(_) => std::future::pending::<()>().await,
    }
}

/// Persistent accept errors (EMFILE and friends) would otherwise spin the
/// loop.
async fn accept_failed(proto: &str, e: io::Error) {
    error!("{} accept: {}", proto, e);
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

fn log_connect_error(e: &ConnectError) {
    match e {
        ConnectError::Balancer(_) => error!("Server fault: {}", e),
        _ => warn!("{}", e),
    }
}

fn peer(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "?".to_string())
}
