//! Implementation of [Connector] for TCP.

use crate::backend::{self, Backend, Error};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::Duration;

// How long a validity probe waits for the socket to say anything.
const PROBE_WINDOW: Duration = Duration::from_millis(10);

/// Connects plain TCP streams to backends.
///
/// Resolution of [Connector::connect] is the pool's whole "connected"
/// signal; the slot driving the attempt imposes the per-attempt timeout.
/// Validity checks surface closes the kernel already knows about, which is
/// the most a transport-level connector can offer.
pub struct TcpConnector {}

#[async_trait]
impl backend::Connector for TcpConnector {
    type Connection = TcpStream;

    async fn connect(&self, backend: &Backend) -> Result<Self::Connection, Error> {
        let stream = TcpStream::connect(backend.address).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Error> {
        // Peek, never read: a probe must not consume connection traffic.
        // An immediate EOF or socket error is a close or reset already
        // delivered to the kernel; silence for the whole probe window is an
        // idle socket in good standing. A peer that vanished without a FIN
        // or RST in flight can only be caught by a protocol-level ping,
        // which plain TCP has no vocabulary for.
        let mut buf = [0u8; 1];
        match tokio::time::timeout(PROBE_WINDOW, conn.peek(&mut buf)).await {
            Ok(Ok(0)) => Err(anyhow::anyhow!("peer closed the connection").into()),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::Connector as _;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_detects_a_closed_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = TcpConnector {};
        let backend = Backend::new(addr);

        let mut conn = connector.connect(&backend).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        assert!(connector.is_valid(&mut conn).await.is_ok());

        // Once the server hangs up, the FIN reaches the client socket and
        // the next probe reports the close.
        drop(server_side);
        let mut closed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if connector.is_valid(&mut conn).await.is_err() {
                closed = true;
                break;
            }
        }
        assert!(closed, "probe never noticed the peer closing");
    }
}
