use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use clustervisor::{ClusterConfig, EcvConfig, HandlerFn, LogWriter, Supervisor};

/// A clustered echo server.
///
/// Run with `cargo run --example echo --features logging`, then:
/// - `nc 127.0.0.1 8080` to talk to a worker
/// - `curl http://127.0.0.1:8081/` for the cluster stats
/// - `curl http://127.0.0.1:8082/ecv` for the health check
/// - Ctrl-C for an abrupt stop, SIGTERM for a graceful drain
#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = ClusterConfig {
        ports: vec![8080],
        workers: 2,
        idle_timeout: Duration::from_secs(30),
        conn_threshold: 10_000,
        heartbeat_interval: Duration::from_secs(10),
        aggregation_interval: Duration::from_secs(10),
        ecv: Some(EcvConfig::default()),
        ..ClusterConfig::default()
    };

    let supervisor = Supervisor::builder(cfg)
        .with_subscriber(Arc::new(LogWriter))
        .build();

    let echo = HandlerFn::new(|mut stream, ctl, shutdown| async move {
        ctl.counter("echo_connections").await;
        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                read = stream.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(());
                    }
                    stream.write_all(&buf[..n]).await?;
                }
            }
        }
    });

    supervisor.run(echo).await?;
    Ok(())
}
