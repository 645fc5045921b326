//! Minimal HTTP/1.1 client for the engine API.
//!
//! Opens a fresh connection per request through a [`Connector`], so
//! long-lived streaming responses (events, logs) never block other calls.
//! Response bodies are exposed as `AsyncBufRead` readers for the stream
//! decoders, and attach/exec sessions use [`HttpClient::upgrade`] to take
//! over the raw connection after `101 Switching Protocols`.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use http_body_util::{BodyExt, BodyStream, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value;
use tokio_util::io::StreamReader;

use crate::error::{Error, Result};
use crate::transport::{BoxedConnection, Connector};

/// Buffered reader over a streaming response body.
pub type BodyReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// Characters left as-is in query components (RFC 3986 unreserved).
const QUERY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Query string parameters, in order.
pub type Query = Vec<(String, String)>;

/// A successfully upgraded connection.
#[derive(Debug)]
pub struct UpgradedConnection {
    /// Raw duplex pipe taken over from HTTP.
    pub connection: BoxedConnection,
    /// Status of the upgrade response (always 101).
    pub status: StatusCode,
    /// Headers of the upgrade response.
    pub headers: HeaderMap,
}

/// HTTP client bound to one engine address.
#[derive(Debug, Clone)]
pub struct HttpClient {
    connector: Arc<dyn Connector>,
    api_version: Option<String>,
}

impl HttpClient {
    /// Create a client. `api_version` (e.g. `"v1.43"`) prefixes every path.
    pub fn new(connector: Arc<dyn Connector>, api_version: Option<String>) -> Self {
        Self {
            connector,
            api_version,
        }
    }

    /// Build the request target for `path` and `query`.
    pub fn url(&self, path: &str, query: &[(String, String)]) -> String {
        let path = path.trim_start_matches('/');
        let mut url = match &self.api_version {
            Some(version) => format!("/{}/{}", version.trim_matches('/'), path),
            None => format!("/{path}"),
        };
        if !query.is_empty() {
            url.push('?');
            let pairs: Vec<String> = query
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}={}",
                        utf8_percent_encode(k, QUERY_COMPONENT),
                        utf8_percent_encode(v, QUERY_COMPONENT)
                    )
                })
                .collect();
            url.push_str(&pairs.join("&"));
        }
        url
    }

    /// Send a request and return the response with its body still streaming.
    ///
    /// # Errors
    ///
    /// Non-success statuses are turned into [`Error::Api`].
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Response<Incoming>> {
        let request = self.build(method, path, query, body, false)?;
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response)
    }

    /// Send a request with a raw body and caller-supplied headers.
    ///
    /// # Errors
    ///
    /// Non-success statuses are turned into [`Error::Api`].
    pub async fn request_raw(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response<Incoming>> {
        let mut request = Request::builder()
            .method(method)
            .uri(self.url(path, query))
            .body(Full::new(body))
            .map_err(|e| Error::Http(format!("Failed to build request: {e}")))?;
        request
            .headers_mut()
            .insert(header::HOST, HeaderValue::from_static("localhost"));
        request.headers_mut().extend(headers);

        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response)
    }

    /// Send a request and decode the whole body as JSON.
    ///
    /// An empty body decodes to `Value::Null`.
    pub async fn request_json(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let response = self.request(method, path, query, body).await?;
        let bytes = collect_body(response).await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Send an upgrade request (`Connection: Upgrade`, `Upgrade: tcp`) and
    /// take over the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpgradeFailed`] when the engine answers with
    /// anything other than `101 Switching Protocols`. Never retried.
    pub async fn upgrade(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<UpgradedConnection> {
        let request = self.build(method, path, query, body, true)?;
        let response = self.send(request).await?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            let status = response.status().as_u16();
            let message = match api_error(response).await {
                Error::Api { message, .. } => message,
                other => other.to_string(),
            };
            log::warn!("[Http] Upgrade refused ({status}): {message}");
            return Err(Error::UpgradeFailed { status, message });
        }

        let status = response.status();
        let headers = response.headers().clone();
        let upgraded = hyper::upgrade::on(response)
            .await
            .map_err(|e| Error::UpgradeFailed {
                status: status.as_u16(),
                message: e.to_string(),
            })?;

        Ok(UpgradedConnection {
            connection: Box::new(TokioIo::new(upgraded)),
            status,
            headers,
        })
    }

    fn build(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        upgrade: bool,
    ) -> Result<Request<Full<Bytes>>> {
        let payload = match body {
            Some(value) => Bytes::from(serde_json::to_vec(value)?),
            None => Bytes::new(),
        };

        let mut request = Request::builder()
            .method(method)
            .uri(self.url(path, query))
            .body(Full::new(payload))
            .map_err(|e| Error::Http(format!("Failed to build request: {e}")))?;

        let headers = request.headers_mut();
        headers.insert(header::HOST, HeaderValue::from_static("localhost"));
        if body.is_some() {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }
        if upgrade {
            headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
            headers.insert(header::UPGRADE, HeaderValue::from_static("tcp"));
        }
        Ok(request)
    }

    async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        let connection = self.connector.connect().await.map_err(|e| {
            Error::Http(format!("Failed to connect to engine: {e}"))
        })?;

        let (mut sender, conn) = http1::handshake(TokioIo::new(connection)).await?;

        // The connection task must keep running for streaming bodies and upgrades.
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                if !e.is_canceled() && !e.is_incomplete_message() {
                    log::debug!("[Http] Engine connection ended: {e}");
                }
            }
        });

        log::debug!("[Http] {} {}", request.method(), request.uri());
        Ok(sender.send_request(request).await?)
    }
}

/// Turn a streaming response into a buffered reader for the decoders.
pub fn body_reader(response: Response<Incoming>) -> BodyReader {
    let frames = TryStreamExt::map_err(BodyStream::new(response.into_body()), hyper_to_io)
        .try_filter_map(|frame| async move { Ok(frame.into_data().ok()) });
    StreamReader::new(frames.boxed())
}

/// Read a whole response body.
pub async fn collect_body(response: Response<Incoming>) -> Result<Bytes> {
    Ok(response.into_body().collect().await?.to_bytes())
}

/// Build an [`Error::Api`] from a failed response, using the JSON
/// `message` field when the engine sent one.
async fn api_error(response: Response<Incoming>) -> Error {
    let status = response.status().as_u16();
    let body = match collect_body(response).await {
        Ok(body) => body,
        Err(e) => return e,
    };
    let message = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(&body).trim().to_string());
    Error::Api { status, message }
}

/// Map a hyper body error onto an I/O error kind the decoders understand.
fn hyper_to_io(err: hyper::Error) -> io::Error {
    if err.is_incomplete_message() {
        return io::Error::new(io::ErrorKind::UnexpectedEof, err);
    }
    if err.is_closed() || err.is_canceled() {
        return io::Error::new(io::ErrorKind::ConnectionAborted, err);
    }
    let kind = std::error::Error::source(&err)
        .and_then(|source| source.downcast_ref::<io::Error>())
        .map_or(io::ErrorKind::Other, io::Error::kind);
    io::Error::new(kind, err)
}

/// Build a query list from `(key, value)` pairs.
pub fn query<K, V, I>(pairs: I) -> Query
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: ToString,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpConnector;

    fn client(version: Option<&str>) -> HttpClient {
        HttpClient::new(
            Arc::new(TcpConnector::new("127.0.0.1:1")),
            version.map(str::to_string),
        )
    }

    #[test]
    fn test_url_with_version_and_query() {
        let url = client(Some("v1.43")).url(
            "/containers/abc/logs",
            &query([("follow", "1"), ("tail", "all")]),
        );
        assert_eq!(url, "/v1.43/containers/abc/logs?follow=1&tail=all");
    }

    #[test]
    fn test_url_without_version() {
        assert_eq!(client(None).url("events", &[]), "/events");
    }

    #[test]
    fn test_query_encoding() {
        let url = client(None).url("events", &query([("filters", "{\"type\":[\"container\"]}")]));
        assert_eq!(
            url,
            "/events?filters=%7B%22type%22%3A%5B%22container%22%5D%7D"
        );
    }

    #[test]
    fn test_query_keeps_unreserved_characters() {
        let url = client(None).url(
            "images/create",
            &query([("fromImage", "my-repo/app_1.0~rc"), ("tag", "a b")]),
        );
        assert_eq!(url, "/images/create?fromImage=my-repo%2Fapp_1.0~rc&tag=a%20b");
    }

    #[test]
    fn test_upgrade_headers() {
        let request = client(None)
            .build(Method::POST, "exec/1/start", &[], Some(&serde_json::json!({})), true)
            .unwrap();
        assert_eq!(request.headers()[header::CONNECTION], "Upgrade");
        assert_eq!(request.headers()[header::UPGRADE], "tcp");
        assert_eq!(request.headers()[header::CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_reset_maps_to_disconnect_kind() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(crate::error::is_disconnect(&err));
    }

    #[tokio::test]
    async fn test_connect_failure_is_http_error() {
        let result = client(None).request(Method::GET, "_ping", &[], None).await;
        assert!(matches!(result, Err(Error::Http(_))));
    }
}
