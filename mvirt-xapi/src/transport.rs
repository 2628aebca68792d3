//! Transport seam between the pool logic and the XML-RPC endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::{Result, XapiError};
use crate::xmlrpc::{self, Value};

/// A channel to one pool member.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address of the member this transport talks to.
    fn address(&self) -> &str;

    /// Issue one remote call and return the unwrapped `Value`.
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value>;
}

/// Opens transports to pool members by address.
pub trait TransportFactory: Send + Sync {
    fn open(&self, address: &str, wait: Duration) -> Arc<dyn Transport>;
}

/// XML-RPC over HTTPS.
pub struct HttpTransport {
    address: String,
    url: String,
    client: reqwest::Client,
    wait: Duration,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, address: &str, wait: Duration) -> Self {
        Self {
            address: address.to_string(),
            url: format!("https://{}/", address),
            client,
            wait,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn address(&self) -> &str {
        &self.address
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let body = xmlrpc::encode_call(method, &params);
        trace!(address = %self.address, method = %method, "XML-RPC call");

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .timeout(self.wait)
            .body(body)
            .send()
            .await
            .map_err(|e| XapiError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(XapiError::Transport(format!(
                "HTTP {} from {}",
                status, self.address
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| XapiError::Transport(e.to_string()))?;

        let result = xmlrpc::decode_api_response(&text);
        if let Err(ref e) = result {
            debug!(address = %self.address, method = %method, error = %e, "XML-RPC call failed");
        }
        result
    }
}

/// Builds [`HttpTransport`]s sharing one HTTP client.
pub struct HttpTransportFactory {
    client: reqwest::Client,
}

impl HttpTransportFactory {
    /// Pool members usually present self-signed certificates, so
    /// `accept_invalid_certs` is normally on.
    pub fn new(accept_invalid_certs: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| XapiError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl TransportFactory for HttpTransportFactory {
    fn open(&self, address: &str, wait: Duration) -> Arc<dyn Transport> {
        Arc::new(HttpTransport::new(self.client.clone(), address, wait))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_targets_member_root() {
        let transport = HttpTransport::new(
            reqwest::Client::new(),
            "192.168.10.5",
            Duration::from_secs(5),
        );
        assert_eq!(transport.address(), "192.168.10.5");
        assert_eq!(transport.url, "https://192.168.10.5/");
    }

    #[tokio::test]
    async fn unreachable_member_is_transport_error() {
        let factory = HttpTransportFactory::new(true).unwrap();
        // Port 9 (discard) on localhost is closed in test environments.
        let transport = factory.open("127.0.0.1:9", Duration::from_secs(2));
        let err = transport
            .call("session.logout", vec![Value::from("OpaqueRef:x")])
            .await
            .unwrap_err();
        assert!(matches!(err, XapiError::Transport(_)));
    }
}
