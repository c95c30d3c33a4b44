use crate::config::NetworkConfig;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Cheap connectivity check against the model host.
pub trait NetworkProbe: Send + Sync {
    fn is_reachable(&self) -> BoxFuture<'_, bool>;
}

/// Opens (and drops) a TCP connection to the hub.
#[derive(Clone, Debug)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(
            config.probe_host.clone(),
            config.probe_port,
            config.probe_timeout(),
        )
    }
}

impl NetworkProbe for TcpProbe {
    fn is_reachable(&self) -> BoxFuture<'_, bool> {
        async move {
            let connect = TcpStream::connect((self.host.as_str(), self.port));
            match tokio::time::timeout(self.timeout, connect).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    debug!("probe {}:{} failed: {}", self.host, self.port, e);
                    false
                }
                Err(_) => {
                    debug!("probe {}:{} timed out", self.host, self.port);
                    false
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn local_listener_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_secs(1));
        assert!(probe.is_reachable().await);
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_secs(1));
        assert!(!probe.is_reachable().await);
    }

    #[tokio::test]
    async fn unresolvable_host_is_unreachable() {
        let probe = TcpProbe::new("host.invalid", 443, Duration::from_millis(500));
        assert!(!probe.is_reachable().await);
    }
}
