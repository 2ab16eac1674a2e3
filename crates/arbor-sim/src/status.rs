use crate::events::*;
use crate::protocols::{self, StatusReply, StatusRequest, STATUS_SERVICE};
use arbor_overlay::{Client, HostConfig, LocalTest, ProtocolRegistry, ServiceRegistry};
use arbor_transport::TransportConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Start `hosts` hosts and query each one's status service as a client.
pub async fn run(
    hosts: usize,
    transport: TransportConfig,
    timeout: Duration,
) -> anyhow::Result<()> {
    emit(&EventStarted::new("status", hosts));

    let services = ServiceRegistry::new();
    protocols::register_services(&services)?;
    let mut local = LocalTest::with_config(
        Arc::new(ProtocolRegistry::new()),
        Arc::new(services),
        HostConfig::new().transport(transport.clone()),
    );
    let hosts = local.gen_hosts(hosts).await?;

    let client = Client::new(STATUS_SERVICE)
        .timeout(timeout)
        .transport(transport);
    let mut failed = 0;
    for host in &hosts {
        let sent = Instant::now();
        match client
            .request::<_, StatusReply>(host.entity(), &StatusRequest)
            .await
        {
            Ok(reply) => emit(&EventServiceStatus {
                event: "service_status",
                rtt_ms: sent.elapsed().as_secs_f64() * 1000.0,
                reply,
            }),
            Err(e) => {
                failed += 1;
                eprintln!("  status of {} failed: {e}", host.entity());
            }
        }
    }

    local.close_all().await;
    if failed > 0 {
        anyhow::bail!("{failed}/{} status requests failed", hosts.len());
    }
    Ok(())
}
