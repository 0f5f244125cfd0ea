use std::io;

use bytes::BytesMut;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUFFER_SIZE: usize = 16 * 1024;

/// Couples two connections: bytes read from one are written to the other.
///
/// Each direction has a single buffer and only reads again once the previous
/// write completed, so a slow peer throttles the opposite reader. As soon as
/// either connection reaches EOF or fails, both are shut down.
pub struct BidirectionalRelay<A, B> {
    a: A,
    b: B,
    pending: BytesMut,
}

impl<A, B> BidirectionalRelay<A, B>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    /// Takes ownership of both ends, so the same connection can never be
    /// paired with itself or with a third one.
    pub fn new(a: A, b: B) -> Self {
        Self {
            a,
            b,
            pending: BytesMut::new(),
        }
    }

    /// Bytes already read from `a` that must reach `b` before anything else.
    pub fn with_pending(mut self, pending: BytesMut) -> Self {
        self.pending = pending;
        self
    }

    /// Runs until one side closes. Returns the bytes moved `a -> b` and
    /// `b -> a`.
    pub async fn run(self) -> io::Result<(u64, u64)> {
        let Self { a, b, pending } = self;
        let (mut a_reader, mut a_writer) = tokio::io::split(a);
        let (mut b_reader, mut b_writer) = tokio::io::split(b);

        let mut a_to_b = pending.len() as u64;
        let mut b_to_a = 0u64;

        if !pending.is_empty() {
            b_writer.write_all(&pending).await?;
            b_writer.flush().await?;
        }

        let result = tokio::select! {
            r = pipe(&mut a_reader, &mut b_writer, &mut a_to_b) => r,
            r = pipe(&mut b_reader, &mut a_writer, &mut b_to_a) => r,
        };

        let _ = a_writer.shutdown().await;
        let _ = b_writer.shutdown().await;
        debug!("relay closed: {} bytes out, {} bytes in", a_to_b, b_to_a);

        result.map(|_| (a_to_b, b_to_a))
    }
}

/// Copies `reader` into `writer` until EOF, one buffer in flight at a time.
async fn pipe<R, W>(reader: &mut R, writer: &mut W, count: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *count += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    #[tokio::test]
    async fn forwards_both_directions_in_order() {
        let (mut client, a) = duplex(64);
        let (b, mut upstream) = duplex(64);
        let relay = tokio::spawn(BidirectionalRelay::new(a, b).run());

        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                client.write_all(&payload).await.unwrap();
                client
            })
        };

        let mut received = vec![0u8; payload.len()];
        upstream.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);

        let mut client = writer.await.unwrap();
        upstream.write_all(b"pong").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        drop(client);
        let (out, back) = timeout(Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(out, 4096);
        assert_eq!(back, 4);
    }

    #[tokio::test]
    async fn closing_one_side_closes_the_other() {
        let (client, a) = duplex(64);
        let (b, mut upstream) = duplex(64);
        let relay = tokio::spawn(BidirectionalRelay::new(a, b).run());

        drop(client);

        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), upstream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        timeout(Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn slow_reader_throttles_writer() {
        const WINDOW: usize = 4096;
        let (mut client, a) = duplex(WINDOW);
        let (b, mut upstream) = duplex(WINDOW);
        let _relay = tokio::spawn(BidirectionalRelay::new(a, b).run());

        let chunk = [7u8; 512];
        let mut written = 0;
        while let Ok(r) = timeout(Duration::from_millis(100), client.write_all(&chunk)).await {
            r.unwrap();
            written += chunk.len();
            assert!(written <= 1024 * 1024, "writer never stalled");
        }

        // the client's window, one relay read and the upstream window
        assert!(written > WINDOW);
        assert!(written <= 2 * WINDOW + WINDOW.min(BUFFER_SIZE));

        let mut drained = vec![0u8; WINDOW];
        upstream.read_exact(&mut drained).await.unwrap();
        assert!(drained.iter().all(|b| *b == 7));
        timeout(Duration::from_secs(5), client.write_all(&chunk))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn pending_bytes_go_first() {
        let (mut client, a) = duplex(64);
        let (b, mut upstream) = duplex(64);
        let relay = BidirectionalRelay::new(a, b).with_pending(BytesMut::from(&b"early "[..]));
        let relay = tokio::spawn(relay.run());

        client.write_all(b"late").await.unwrap();
        let mut buf = [0u8; 10];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early late");

        drop(upstream);
        let (out, _) = timeout(Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(out, 10);
    }
}
