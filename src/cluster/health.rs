//! Health checks run on every reconciliation tick

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::CheckConfig;
use crate::metrics::{MemberLabels, Metrics};
use crate::network::check_tcp_address;

/// A failed health check, delivered to the decision loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub name: String,
    pub address: String,
    pub reason: String,
}

/// Spawn one independent probe per configured check.
///
/// Every probe updates its gauge; failures are also reported on `reports`.
/// Checks with an unsupported protocol are logged and skipped.
pub(crate) fn spawn_checks(
    checks: &[CheckConfig],
    checks_interval: u64,
    metrics: &Arc<Metrics>,
    labels: &MemberLabels,
    reports: &mpsc::Sender<HealthReport>,
) {
    for check in checks {
        if !check.protocol.eq_ignore_ascii_case("tcp") {
            error!(
                "Check port {} the protocol type is not supported: {}",
                check.name, check.protocol
            );
            continue;
        }

        let timeout = check.timeout_duration(checks_interval);
        let check = check.clone();
        let metrics = metrics.clone();
        let labels = labels.clone();
        let reports = reports.clone();

        tokio::spawn(async move {
            info!("Open check port: {}", check.name);
            run_check(&check, timeout, &metrics, &labels, &reports).await;
        });
    }
}

async fn run_check(
    check: &CheckConfig,
    timeout: Duration,
    metrics: &Metrics,
    labels: &MemberLabels,
    reports: &mpsc::Sender<HealthReport>,
) {
    match check_tcp_address(&check.address, timeout).await {
        Ok(()) => {
            debug!("Check {} ({}) passed", check.name, check.address);
            metrics.set_check(labels, &check.name, &check.address, true);
        }
        Err(e) => {
            error!("Check {} ({}) failed: {}", check.name, check.address, e);
            metrics.set_check(labels, &check.name, &check.address, false);
            let report = HealthReport {
                name: check.name.clone(),
                address: check.address.clone(),
                reason: e.to_string(),
            };
            // The loop may already be gone during shutdown
            let _ = reports.send(report).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn labels() -> MemberLabels {
        MemberLabels {
            cluster: "test".to_string(),
            server_id: "node1".to_string(),
            server_address: "127.0.0.1:7000".to_string(),
            vip: "10.0.0.100".to_string(),
        }
    }

    fn check(name: &str, address: &str, protocol: &str) -> CheckConfig {
        CheckConfig {
            name: name.to_string(),
            address: address.to_string(),
            protocol: protocol.to_string(),
            timeout: 1,
        }
    }

    fn gauge(metrics: &Metrics, check: &CheckConfig) -> i64 {
        let labels = labels();
        metrics
            .check_port
            .with_label_values(&[
                labels.cluster.as_str(),
                labels.server_id.as_str(),
                labels.server_address.as_str(),
                check.name.as_str(),
                check.address.as_str(),
            ])
            .get()
    }

    #[tokio::test]
    async fn test_passing_check_sets_gauge() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let check = check("web", &listener.local_addr().unwrap().to_string(), "tcp");
        let metrics = Metrics::new();
        let (tx, mut rx) = mpsc::channel(4);

        run_check(&check, Duration::from_millis(500), &metrics, &labels(), &tx).await;

        assert_eq!(gauge(&metrics, &check), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failing_check_reports() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let check = check("db", &addr, "tcp");
        let metrics = Metrics::new();
        let (tx, mut rx) = mpsc::channel(4);

        run_check(&check, Duration::from_millis(500), &metrics, &labels(), &tx).await;

        assert_eq!(gauge(&metrics, &check), 0);
        let report = rx.try_recv().unwrap();
        assert_eq!(report.name, "db");
        assert_eq!(report.address, addr);
    }

    #[tokio::test]
    async fn test_unsupported_protocol_is_skipped() {
        let metrics = Arc::new(Metrics::new());
        let (tx, mut rx) = mpsc::channel(4);

        spawn_checks(
            &[check("dns", "127.0.0.1:1", "udp")],
            5,
            &metrics,
            &labels(),
            &tx,
        );
        drop(tx);

        // No probe was spawned, so the channel closes without a report
        assert!(rx.recv().await.is_none());
    }
}
