use std::io;
use std::net::{IpAddr, SocketAddr};

use bytes::{Buf, BytesMut};
use httparse::Status;
use socks5::Endpoint;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEADER_SIZE: usize = 8192;
const MAX_HEADERS: usize = 64;
const DEFAULT_VERSION: &str = "HTTP/1.1";

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("http: client closed")]
    Closed,
    #[error("http: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("http: invalid method {0}")]
    BadMethod(String),
    #[error("http: duplicate header {name}")]
    DuplicateHeader { name: String, version: String },
    #[error("http: invalid CONNECT target {0}")]
    BadTarget(String),
    #[error("http: header too large")]
    TooLarge,
}

impl HttpError {
    /// Version to answer with; falls back to HTTP/1.1 when the request line
    /// never parsed.
    fn version(&self) -> &str {
        match self {
            HttpError::DuplicateHeader { version, .. } => version,
            _ => DEFAULT_VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    /// Destination of a CONNECT request: `host:port`, host possibly a
    /// bracketed IPv6 literal.
    pub fn connect_endpoint(&self) -> Result<Endpoint, HttpError> {
        let bad_target = || HttpError::BadTarget(self.target.clone());

        let (host, port) = self.target.rsplit_once(':').ok_or_else(bad_target)?;
        let port: u16 = port.parse().map_err(|_| bad_target())?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(bad_target());
        }

        match host.parse::<IpAddr>() {
            Ok(ip) => Ok(Endpoint::Ip(SocketAddr::new(ip, port))),
            Err(_) => Ok(Endpoint::Host(host.to_string(), port)),
        }
    }
}

pub enum Response {
    Ok,
    MethodNotAllowed,
    InternalServerError,
}

impl Response {
    fn status_line(&self) -> &'static str {
        match self {
            Response::Ok => "200 OK",
            Response::MethodNotAllowed => "405 Method Not Allowed",
            Response::InternalServerError => "500 Internal Server Error",
        }
    }

    pub fn encode(&self, version: &str) -> String {
        format!("{} {}\r\n\r\n", version, self.status_line())
    }
}

/// Parses one request head from the front of `buf`.
///
/// Returns `Ok(None)` until the terminating empty line is buffered; on success
/// the head is removed from `buf` and anything after it stays.
pub fn parse_request(buf: &mut BytesMut) -> Result<Option<Request>, HttpError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(&buf[..])? {
        Status::Complete(len) => len,
        Status::Partial => {
            if buf.len() >= MAX_HEADER_SIZE {
                return Err(HttpError::TooLarge);
            }
            return Ok(None);
        }
    };

    let method = req.method.unwrap_or_default().to_string();
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(HttpError::BadMethod(method));
    }
    let target = req.path.unwrap_or_default().to_string();
    let version = format!("HTTP/1.{}", req.version.unwrap_or(1));

    let mut parsed: Vec<(String, String)> = Vec::with_capacity(req.headers.len());
    for header in req.headers.iter() {
        if parsed.iter().any(|(name, _)| name.eq_ignore_ascii_case(header.name)) {
            return Err(HttpError::DuplicateHeader {
                name: header.name.to_string(),
                version,
            });
        }
        let value = String::from_utf8_lossy(header.value).into_owned();
        parsed.push((header.name.to_string(), value));
    }

    buf.advance(len);
    Ok(Some(Request {
        method,
        target,
        version,
        headers: parsed,
    }))
}

pub struct HttpIncoming<S> {
    stream: S,
    buf: BytesMut,
    request: Request,
}

impl<S> HttpIncoming<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Answers 200 and gives back the stream with any bytes the client sent
    /// after the request head.
    pub async fn respond_ok(mut self) -> io::Result<(S, BytesMut)> {
        let response = Response::Ok.encode(&self.request.version);
        self.stream.write_all(response.as_bytes()).await?;
        Ok((self.stream, self.buf))
    }

    pub async fn respond_err(mut self, response: Response) -> io::Result<()> {
        let response = response.encode(&self.request.version);
        self.stream.write_all(response.as_bytes()).await?;
        self.stream.shutdown().await
    }
}

pub struct HttpProxy;

impl HttpProxy {
    /// Reads the request head. Malformed requests are answered with 500 and
    /// the stream is closed before the error is returned.
    pub async fn accept<S>(mut stream: S) -> Result<HttpIncoming<S>, HttpError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(1500);

        let result = loop {
            match parse_request(&mut buf) {
                Ok(Some(request)) => break Ok(request),
                Ok(None) => {}
                Err(e) => break Err(e),
            }

            match stream.read_buf(&mut buf).await {
                Ok(0) => return Err(HttpError::Closed),
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }
        };

        match result {
            Ok(request) => Ok(HttpIncoming {
                stream,
                buf,
                request,
            }),
            Err(e) => {
                let response = Response::InternalServerError.encode(e.version());
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn waits_for_the_empty_line() {
        let mut buf = BytesMut::from(&b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com"[..]);
        assert!(parse_request(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 51);

        buf.extend_from_slice(b":443\r\n\r\nhello");
        let request = parse_request(&mut buf).unwrap().unwrap();
        assert!(request.is_connect());
        assert_eq!(request.target, "example.com:443");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(
            request.headers,
            vec![("Host".to_string(), "example.com:443".to_string())]
        );
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn rejects_duplicate_headers() {
        let mut buf =
            BytesMut::from(&b"CONNECT a:1 HTTP/1.0\r\nHost: a\r\nhost: b\r\n\r\n"[..]);
        let err = parse_request(&mut buf).unwrap_err();
        assert!(matches!(err, HttpError::DuplicateHeader { .. }));
        assert_eq!(err.version(), "HTTP/1.0");
    }

    #[test]
    fn rejects_garbage() {
        let mut buf = BytesMut::from(&b"\x05\x01\x00 nonsense\r\n\r\n"[..]);
        assert!(parse_request(&mut buf).is_err());

        let mut buf = BytesMut::from(&b"connect a:1 HTTP/1.1\r\n\r\n"[..]);
        assert!(matches!(
            parse_request(&mut buf),
            Err(HttpError::BadMethod(_))
        ));
    }

    #[test]
    fn connect_targets() {
        let request = |target: &str| Request {
            method: "CONNECT".to_string(),
            target: target.to_string(),
            version: DEFAULT_VERSION.to_string(),
            headers: vec![],
        };

        assert_eq!(
            request("example.com:443").connect_endpoint().unwrap(),
            Endpoint::Host("example.com".to_string(), 443)
        );
        assert_eq!(
            request("[2001:db8::1]:8443").connect_endpoint().unwrap(),
            Endpoint::Ip("[2001:db8::1]:8443".parse().unwrap())
        );
        assert_eq!(
            request("192.0.2.1:80").connect_endpoint().unwrap(),
            Endpoint::Ip("192.0.2.1:80".parse().unwrap())
        );
        assert!(request("example.com").connect_endpoint().is_err());
        assert!(request("example.com:99999").connect_endpoint().is_err());
        assert!(request(":80").connect_endpoint().is_err());
    }

    #[test]
    fn responses() {
        assert_eq!(Response::Ok.encode("HTTP/1.0"), "HTTP/1.0 200 OK\r\n\r\n");
        assert_eq!(
            Response::MethodNotAllowed.encode("HTTP/1.1"),
            "HTTP/1.1 405 Method Not Allowed\r\n\r\n"
        );
        assert_eq!(
            Response::InternalServerError.encode("HTTP/1.1"),
            "HTTP/1.1 500 Internal Server Error\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn malformed_request_gets_500() {
        let (mut client, server) = duplex(1024);
        client
            .write_all(b"CONNECT a:1 HTTP/1.1\r\nX: 1\r\nX: 2\r\n\r\n")
            .await
            .unwrap();

        assert!(HttpProxy::accept(server).await.is_err());

        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, "HTTP/1.1 500 Internal Server Error\r\n\r\n");
    }
}
