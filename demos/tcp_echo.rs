//! Claims TCP connections from a pool and bounces bytes off an echo server.
//!
//! Start a server first, e.g. `ncat -l -k -e /bin/cat 1234`, then:
//!
//! ```text
//! cargo run --example tcp_echo -- 127.0.0.1:1234
//! ```

use std::sync::Arc;
use tether::connectors::tcp::TcpConnector;
use tether::policy::Policy;
use tether::pool::Pool;
use tether::resolvers::single_host::SingleHostResolver;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tokio::time::Duration;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "[::1]:1234".to_string())
        .parse()
        .expect("expected an <address>:<port> argument");

    let resolver = Box::new(SingleHostResolver::new(address));
    let backend_connector = Arc::new(TcpConnector {});
    let policy = Policy::default();

    let pool = Pool::new(resolver, backend_connector, policy).expect("valid policy");

    loop {
        sleep(Duration::from_secs(1)).await;

        println!("making claim");
        match pool.claim().await {
            Ok(mut stream) => {
                if let Err(err) = stream.write_all(b"hello").await {
                    eprintln!("Failed to write to server: {err:?}");
                    continue;
                }

                let mut buf = [0; 5];
                if let Err(err) = stream.read_exact(&mut buf[..]).await {
                    eprintln!("Failed to read from server: {err:?}");
                    continue;
                }
                assert_eq!(&buf, b"hello");
                println!("Contacted server!");
            }
            Err(err) => {
                eprintln!("Failed to grab claim: {err:?}");
            }
        }
    }
}
