//! HTTP transport for the Consul agent API.

use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use tracing::debug;

use rollcall_catalog::duration::{MAX_WAIT, format_duration};
use rollcall_catalog::{
    CatalogError, CatalogFuture, CatalogResult, CheckStatus, CoordinationClient, HealthQuery,
    ServiceInstance, Snapshot, WatchIndex,
};

use crate::wire::{HealthEntry, RegisterBody, TtlUpdateBody};

const INDEX_HEADER: &str = "x-consul-index";
const TOKEN_HEADER: &str = "x-consul-token";

/// Connection settings for the Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulConfig {
    /// Agent HTTP endpoint (`host:port`).
    pub address: String,
    /// Datacenter for health queries; the agent's own when `None`.
    pub datacenter: Option<String>,
    /// ACL token sent with every request.
    pub token: Option<String>,
    /// Timeout for non-blocking calls.
    pub timeout: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8500".to_string(),
            datacenter: None,
            token: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// `CoordinationClient` backed by a Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    config: ConsulConfig,
}

/// Status, blocking index, and body of a completed call.
#[derive(Debug)]
struct RawResponse {
    status: StatusCode,
    index: Option<WatchIndex>,
    body: Bytes,
}

impl RawResponse {
    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).trim().to_string()
    }

    fn rejected(&self) -> CatalogError {
        CatalogError::Rejected {
            status: self.status.as_u16(),
            body: self.body_text(),
        }
    }
}

impl ConsulClient {
    /// Create a client for the given agent.
    pub fn new(config: ConsulConfig) -> Self {
        Self { config }
    }

    fn uri(&self, path: &str, query: &[(&str, String)]) -> String {
        let mut params: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
        if let Some(dc) = &self.config.datacenter {
            params.push(format!("dc={dc}"));
        }

        if params.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{}", params.join("&"))
        }
    }

    /// Perform one request on a fresh connection.
    async fn send(
        &self,
        method: Method,
        uri: String,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> CatalogResult<RawResponse> {
        let address = self.config.address.as_str();

        let exchange = async {
            let stream = tokio::net::TcpStream::connect(address)
                .await
                .map_err(|e| CatalogError::Unreachable(format!("connect {address}: {e}")))?;

            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| CatalogError::Unreachable(format!("handshake {address}: {e}")))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "consul connection closed with error");
                }
            });

            let mut builder = Request::builder()
                .method(method.clone())
                .uri(&uri)
                .header(HOST, address)
                .header(USER_AGENT, "rollcall/0.1");
            if let Some(token) = &self.config.token {
                builder = builder.header(TOKEN_HEADER, token);
            }
            if body.is_some() {
                builder = builder.header(CONTENT_TYPE, "application/json");
            }

            let req = builder
                .body(Full::new(Bytes::from(body.unwrap_or_default())))
                .map_err(|e| CatalogError::Invalid(format!("build request {uri}: {e}")))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| CatalogError::Unreachable(format!("{method} {uri}: {e}")))?;

            let status = resp.status();
            let index = resp
                .headers()
                .get(INDEX_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<WatchIndex>().ok());

            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| CatalogError::Unreachable(format!("read body {uri}: {e}")))?
                .to_bytes();

            debug!(%method, %uri, %status, "consul call complete");
            Ok(RawResponse {
                status,
                index,
                body,
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(CatalogError::Unreachable(format!(
                "consul call timed out after {timeout:?}"
            ))),
        }
    }

    async fn put_json<T: serde::Serialize>(
        &self,
        path: &str,
        body: Option<&T>,
    ) -> CatalogResult<RawResponse> {
        let payload = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| CatalogError::Invalid(format!("encode {path}: {e}")))?;
        self.send(Method::PUT, self.uri(path, &[]), payload, self.config.timeout)
            .await
    }

    async fn do_register(&self, instance: &ServiceInstance) -> CatalogResult<()> {
        instance.validate()?;
        let body = RegisterBody::from(instance);
        let resp = self
            .put_json("/v1/agent/service/register", Some(&body))
            .await?;

        if resp.status.is_success() {
            Ok(())
        } else {
            Err(resp.rejected())
        }
    }

    async fn do_deregister(&self, service_id: &str) -> CatalogResult<()> {
        let path = format!("/v1/agent/service/deregister/{service_id}");
        let resp = self.put_json::<()>(&path, None).await?;

        match resp.status {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(CatalogError::ServiceNotFound(service_id.to_string())),
            _ => Err(resp.rejected()),
        }
    }

    async fn do_update_ttl(
        &self,
        check_id: &str,
        note: &str,
        status: CheckStatus,
    ) -> CatalogResult<()> {
        let path = format!("/v1/agent/check/update/{check_id}");
        let body = TtlUpdateBody {
            status: status.as_str(),
            output: note,
        };
        let resp = self.put_json(&path, Some(&body)).await?;

        if resp.status.is_success() {
            return Ok(());
        }
        // Older agents answer an unknown check with a 500.
        if resp.status == StatusCode::NOT_FOUND || resp.body_text().contains("Unknown check") {
            return Err(CatalogError::CheckNotFound(check_id.to_string()));
        }
        Err(resp.rejected())
    }

    async fn do_health_service(
        &self,
        query: &HealthQuery,
        index: WatchIndex,
    ) -> CatalogResult<Snapshot> {
        let wait = query.wait.min(MAX_WAIT);
        let mut params = Vec::new();
        if query.passing_only {
            params.push(("passing", "true".to_string()));
        }
        if index > 0 {
            params.push(("index", index.to_string()));
            params.push(("wait", format_duration(wait)));
        }

        let path = format!("/v1/health/service/{}", query.service);
        // The agent may add up to wait/16 of jitter to a blocking query.
        let timeout = (wait + wait / 16).saturating_add(self.config.timeout);
        let resp = self
            .send(Method::GET, self.uri(&path, &params), None, timeout)
            .await?;

        if !resp.status.is_success() {
            return Err(resp.rejected());
        }

        let index = resp
            .index
            .ok_or_else(|| CatalogError::Decode(format!("{path}: missing X-Consul-Index")))?;
        let entries: Vec<HealthEntry> = serde_json::from_slice(&resp.body)
            .map_err(|e| CatalogError::Decode(format!("{path}: {e}")))?;

        Ok(Snapshot {
            index,
            members: entries.into_iter().map(HealthEntry::into_member).collect(),
        })
    }
}

impl CoordinationClient for ConsulClient {
    fn register<'a>(&'a self, instance: &'a ServiceInstance) -> CatalogFuture<'a, ()> {
        Box::pin(self.do_register(instance))
    }

    fn deregister<'a>(&'a self, service_id: &'a str) -> CatalogFuture<'a, ()> {
        Box::pin(self.do_deregister(service_id))
    }

    fn update_ttl<'a>(
        &'a self,
        check_id: &'a str,
        note: &'a str,
        status: CheckStatus,
    ) -> CatalogFuture<'a, ()> {
        Box::pin(self.do_update_ttl(check_id, note, status))
    }

    fn health_service<'a>(
        &'a self,
        query: &'a HealthQuery,
        index: WatchIndex,
    ) -> CatalogFuture<'a, Snapshot> {
        Box::pin(self.do_health_service(query, index))
    }
}
