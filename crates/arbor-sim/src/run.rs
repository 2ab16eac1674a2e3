use crate::common::{avg, elapsed_s, max, min, setup_ctrlc};
use crate::events::*;
use crate::protocols::{self, Demo};
use arbor_overlay::{HostConfig, LocalTest, ProtocolRegistry, ServiceRegistry};
use arbor_transport::TrafficSnapshot;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub struct RunConfig {
    pub demo: Demo,
    pub hosts: usize,
    pub nodes: usize,
    pub bf: usize,
    pub rounds: u32,
    pub timeout: Duration,
    pub delay_ms: u64,
}

pub async fn run(config: RunConfig, host_config: HostConfig, start: Instant) -> anyhow::Result<()> {
    let name = config.demo.name();
    emit(&EventStarted::new(name, config.hosts));

    let protocols = Arc::new(ProtocolRegistry::new());
    let (reports, mut results) = mpsc::unbounded_channel();
    protocols::register(&protocols, reports)?;
    let services = ServiceRegistry::new();
    protocols::register_services(&services)?;

    let mut local = LocalTest::with_config(protocols, Arc::new(services), host_config);
    let (hosts, _roster, tree) = local
        .gen_big_tree(config.nodes, config.hosts, config.bf, true)
        .await?;
    emit(&EventTree {
        event: "tree",
        tree: tree.id().to_string(),
        nodes: tree.size(),
        depth: tree.depth(),
        branching: config.bf,
        elapsed_s: elapsed_s(start),
    });
    eprintln!(
        "{name}: {} nodes over {} hosts, depth {}",
        tree.size(),
        hosts.len(),
        tree.depth()
    );

    let running = setup_ctrlc();
    let mut durations = Vec::new();
    let mut failed = 0u32;
    let mut round = 0u32;

    while round < config.rounds && running.load(Ordering::Relaxed) {
        round += 1;
        // A report from a round that already timed out must not count.
        while results.try_recv().is_ok() {}

        let round_start = Instant::now();
        let outcome = async {
            local.start_protocol(name, &tree).await?;
            tokio::time::timeout(config.timeout, results.recv())
                .await
                .map_err(|_| anyhow::anyhow!("no report within {:?}", config.timeout))?
                .ok_or_else(|| anyhow::anyhow!("report channel closed"))
        }
        .await;

        match outcome {
            Ok(reached) => {
                let duration_ms = round_start.elapsed().as_secs_f64() * 1000.0;
                durations.push(duration_ms);
                emit(&EventRound {
                    event: "round",
                    protocol: name.to_string(),
                    round,
                    reached,
                    expected: tree.size(),
                    duration_ms,
                    elapsed_s: elapsed_s(start),
                });
                if reached != tree.size() {
                    tracing::warn!(round, reached, expected = tree.size(), "partial round");
                }
            }
            Err(e) => {
                failed += 1;
                eprintln!("  round #{round} failed: {e}");
                emit(&EventRoundFailed {
                    event: "round_failed",
                    protocol: name.to_string(),
                    round,
                    reason: e.to_string(),
                    elapsed_s: elapsed_s(start),
                });
            }
        }

        if config.delay_ms > 0 && round < config.rounds {
            tokio::time::sleep(Duration::from_millis(config.delay_ms)).await;
        }
    }

    let mut traffic = TrafficSnapshot::default();
    for host in &hosts {
        let status = host.status();
        traffic += status.traffic;
        emit(&EventHostStatus {
            event: "host_status",
            status,
        });
    }

    emit(&EventSummary {
        event: "summary",
        mode: name.to_string(),
        rounds: round,
        successful: durations.len() as u32,
        failed,
        avg_ms: avg(&durations),
        min_ms: min(&durations),
        max_ms: max(&durations),
        bytes_sent: traffic.tx_bytes,
        messages_sent: traffic.tx_msgs,
        elapsed_s: elapsed_s(start),
    });
    eprintln!(
        "\nDone: {}/{round} rounds OK, avg: {:.1}ms",
        durations.len(),
        avg(&durations),
    );

    local.close_all().await;
    Ok(())
}
