use thiserror::Error;

use crate::types::NetworkType;

/// Why a batch did not reach the collector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection-level or local failure.
    #[error("network error: {0}")]
    Network(String),
    /// Collector answered with a non-success status.
    #[error("collector responded with status {0}")]
    Status(u16),
    /// The send did not finish within the request timeout.
    #[error("request timed out")]
    Timeout,
}

/// Hands encoded batches to the collector.
///
/// `send` is blocking; the scheduler runs it on the blocking pool under a
/// timeout, so implementations need not enforce one themselves.
pub trait Transport: Send + Sync {
    /// Delivers one batch. `Ok` means the collector acknowledged every record in it.
    fn send(&self, batch: &[u8]) -> Result<(), TransportError>;
    /// Current connectivity class.
    fn network_type(&self) -> NetworkType;
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::types::NetworkType;

    use super::{Transport, TransportError};

    /// Connectivity check supplied by the host platform.
    pub type NetworkCheck = Arc<dyn Fn() -> NetworkType + Send + Sync>;

    /// Blocking HTTP POST transport.
    pub struct HttpTransport {
        endpoint: String,
        client: reqwest::blocking::Client,
        network_check: NetworkCheck,
    }

    impl HttpTransport {
        /// Client posting to `endpoint` with a per-request `timeout`.
        pub fn new(
            endpoint: impl Into<String>,
            timeout: Duration,
            network_check: NetworkCheck,
        ) -> Result<Self, TransportError> {
            let client = reqwest::blocking::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| TransportError::Network(format!("client build failed: {e}")))?;
            Ok(Self {
                endpoint: endpoint.into(),
                client,
                network_check,
            })
        }

        /// Collector URL.
        pub fn endpoint(&self) -> &str {
            &self.endpoint
        }
    }

    impl Transport for HttpTransport {
        fn send(&self, batch: &[u8]) -> Result<(), TransportError> {
            let response = self
                .client
                .post(&self.endpoint)
                .header("content-type", "application/octet-stream")
                .body(batch.to_vec())
                .send()
                .map_err(|e| {
                    if e.is_timeout() {
                        TransportError::Timeout
                    } else {
                        TransportError::Network(e.to_string())
                    }
                })?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(TransportError::Status(status.as_u16()))
            }
        }

        fn network_type(&self) -> NetworkType {
            (self.network_check)()
        }
    }
}
