//! Internet reachability probe feeding the node's connectivity signal.

use std::time::Duration;

use crate::node::NodeHandle;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ReachabilityMonitor {
    client: reqwest::Client,
    url: String,
    interval: Duration,
}

impl ReachabilityMonitor {
    pub fn new(url: impl Into<String>, interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            interval,
        }
    }

    /// One probe: any response with a success status counts as reachable.
    pub async fn probe(&self) -> bool {
        match self.client.get(&self.url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!("probe {} failed: {e}", self.url);
                false
            }
        }
    }

    /// Probe every interval and report changes to `node` until it shuts down.
    pub async fn run(self, node: NodeHandle) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last = None;
        loop {
            ticker.tick().await;
            let up = self.probe().await;
            if last == Some(up) {
                continue;
            }
            tracing::info!("internet {}", if up { "reachable" } else { "unreachable" });
            if node.set_internet_reachable(up).await.is_err() {
                return;
            }
            last = Some(up);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refused_probe_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let monitor = ReachabilityMonitor::new(format!("http://{addr}/"), Duration::from_secs(1));
        assert!(!monitor.probe().await);
    }
}
