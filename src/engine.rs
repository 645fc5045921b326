//! Thin engine facade over the stream layer.
//!
//! Only the endpoints that produce streams are covered: events, logs,
//! exec, attach, resize, wait, stats and image pull/push/build progress. Responses
//! that are plain documents are returned as `serde_json::Value`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use hyper::Method;
use serde::Serialize;
use serde_json::{json, Value};

use crate::channel::PubSubChannel;
use crate::config::ClientConfig;
use crate::error::{self, Error, Result};
use crate::hijack::{Established, HijackedTransport, Resize};
use crate::http::{self, BodyReader, HttpClient, Query};
use crate::jsonstream::JsonLineStream;
use crate::multiplexed::MultiplexedResult;
use crate::pump::{EventBus, LogPump, StreamEvent};
use crate::transport::Connector;

/// Entry point: a client bound to one engine.
#[derive(Debug, Clone)]
pub struct Engine {
    http: HttpClient,
    config: ClientConfig,
}

impl Engine {
    /// Create a client from `config`.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let connector = config.engine_host()?.connector();
        Ok(Self::with_connector(connector, config))
    }

    /// Create a client from the config file and environment.
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::load()?)
    }

    /// Create a client over a custom connector (TLS, SSH tunnels, tests).
    pub fn with_connector(connector: Arc<dyn Connector>, config: ClientConfig) -> Self {
        Self {
            http: HttpClient::new(connector, config.api_version.clone()),
            config,
        }
    }

    /// The underlying HTTP client.
    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn channel(&self) -> PubSubChannel<StreamEvent> {
        PubSubChannel::new(self.config.inbox_capacity, self.config.delivery_policy())
    }

    /// Check that the engine answers.
    pub async fn ping(&self) -> Result<()> {
        let response = self.http.request(Method::GET, "_ping", &[], None).await?;
        http::collect_body(response).await.map(|_| ())
    }

    /// The engine's event stream. Subscribing starts it.
    pub fn events(&self) -> EventBus {
        EventBus::new(self.http.clone(), self.channel())
    }

    /// Handle on a container.
    pub fn container(&self, id: impl Into<String>) -> Container {
        Container {
            engine: self.clone(),
            id: id.into(),
        }
    }

    /// Handle on an existing exec instance.
    pub fn exec(&self, id: impl Into<String>) -> Exec {
        Exec {
            http: self.http.clone(),
            id: id.into(),
            read_buffer: self.config.read_buffer_size,
        }
    }

    /// Image operations.
    pub fn images(&self) -> Images {
        Images {
            http: self.http.clone(),
        }
    }
}

/// Options for reading container logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Include stdout.
    pub stdout: bool,
    /// Include stderr.
    pub stderr: bool,
    /// Keep the stream open for new output.
    pub follow: bool,
    /// Prefix each line with its timestamp.
    pub timestamps: bool,
    /// Only output since this unix timestamp.
    pub since: Option<i64>,
    /// Only output before this unix timestamp.
    pub until: Option<i64>,
    /// Number of trailing lines, or `"all"`.
    pub tail: Option<String>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            since: None,
            until: None,
            tail: None,
        }
    }
}

impl LogOptions {
    fn to_query(&self) -> Result<Query> {
        if !self.stdout && !self.stderr {
            return Err(Error::InvalidArgument(
                "logs need at least one of stdout or stderr".to_string(),
            ));
        }
        let mut query = http::query([
            ("stdout", self.stdout),
            ("stderr", self.stderr),
            ("follow", self.follow),
            ("timestamps", self.timestamps),
        ]);
        if let Some(since) = self.since {
            query.push(("since".to_string(), since.to_string()));
        }
        if let Some(until) = self.until {
            query.push(("until".to_string(), until.to_string()));
        }
        if let Some(tail) = &self.tail {
            query.push(("tail".to_string(), tail.clone()));
        }
        Ok(query)
    }
}

/// Result of [`Container::logs`].
#[derive(Debug)]
pub enum LogOutput {
    /// Followed logs, read frame by frame.
    Stream(MultiplexedResult<BodyReader>),
    /// Everything logged so far, one entry per line.
    Lines(Vec<String>),
}

/// Options for attaching to a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOptions {
    /// Forward stdin.
    pub stdin: bool,
    /// Receive stdout.
    pub stdout: bool,
    /// Receive stderr.
    pub stderr: bool,
    /// Replay earlier output first.
    pub logs: bool,
    /// Key sequence that detaches, e.g. `ctrl-p,ctrl-q`.
    pub detach_keys: Option<String>,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            stdin: false,
            stdout: true,
            stderr: true,
            logs: false,
            detach_keys: None,
        }
    }
}

impl AttachOptions {
    fn to_query(&self) -> Query {
        let mut query = http::query([
            ("stream", true),
            ("stdin", self.stdin),
            ("stdout", self.stdout),
            ("stderr", self.stderr),
            ("logs", self.logs),
        ]);
        if let Some(keys) = &self.detach_keys {
            query.push(("detachKeys".to_string(), keys.clone()));
        }
        query
    }
}

/// Exec instance settings.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ExecConfig {
    /// Command and arguments.
    pub cmd: Vec<String>,
    /// Attach stdin.
    pub attach_stdin: bool,
    /// Attach stdout.
    pub attach_stdout: bool,
    /// Attach stderr.
    pub attach_stderr: bool,
    /// Allocate a TTY.
    pub tty: bool,
    /// Environment as `KEY=value` entries.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// User to run as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Run privileged.
    pub privileged: bool,
    /// Key sequence that detaches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detach_keys: Option<String>,
}

impl ExecConfig {
    /// Run `cmd` with stdout and stderr attached.
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            attach_stdout: true,
            attach_stderr: true,
            ..Self::default()
        }
    }
}

/// Handle on one container.
#[derive(Debug, Clone)]
pub struct Container {
    engine: Engine,
    id: String,
}

impl Container {
    /// Container id or name.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Full inspect document.
    pub async fn inspect(&self) -> Result<Value> {
        inspect(&self.engine.http, &self.id).await
    }

    /// Whether the container was created with a TTY.
    pub async fn is_tty(&self) -> Result<bool> {
        inspect_tty(&self.engine.http, &self.id).await
    }

    /// Read the container's logs.
    ///
    /// With `follow` set the body stays open and is returned as a stream;
    /// otherwise it is drained into lines.
    pub async fn logs(&self, options: &LogOptions) -> Result<LogOutput> {
        let result = open_logs(&self.engine.http, &self.id, options).await?;
        if options.follow {
            Ok(LogOutput::Stream(result))
        } else {
            Ok(LogOutput::Lines(result.collect_lines().await?))
        }
    }

    /// A pump that follows this container's logs for many subscribers.
    pub fn log_pump(&self, options: LogOptions) -> LogPump {
        LogPump::new(
            self.engine.http.clone(),
            self.id.clone(),
            options,
            self.engine.channel(),
        )
    }

    /// Create an exec instance in this container.
    pub async fn exec(&self, config: &ExecConfig) -> Result<Exec> {
        let body = serde_json::to_value(config)?;
        let created = self
            .engine
            .http
            .request_json(
                Method::POST,
                &format!("containers/{}/exec", self.id),
                &[],
                Some(&body),
            )
            .await?;
        let id = created
            .get("Id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("exec create response has no Id".to_string()))?;
        log::debug!("[Engine] Created exec {id} in {}", self.id);
        Ok(self.engine.exec(id))
    }

    /// Attach to the container's streams.
    ///
    /// The connection is opened on first read or write. TTY mode is taken
    /// from the container's configuration at that point.
    pub fn attach(&self, options: AttachOptions) -> HijackedTransport {
        let http = self.engine.http.clone();
        let id = self.id.clone();
        let establisher = move || {
            let http = http.clone();
            let id = id.clone();
            let query = options.to_query();
            async move {
                let tty = inspect_tty(&http, &id).await?;
                let upgraded = http
                    .upgrade(Method::POST, &format!("containers/{id}/attach"), &query, None)
                    .await?;
                Ok(Established {
                    connection: upgraded.connection,
                    tty,
                })
            }
        };

        HijackedTransport::new(format!("attach:{}", self.id), establisher)
            .with_read_buffer(self.engine.config.read_buffer_size)
            .with_resizer(EndpointResizer {
                http: self.engine.http.clone(),
                path: format!("containers/{}/resize", self.id),
            })
    }

    /// Resize the container's TTY.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        resize(
            &self.engine.http,
            &format!("containers/{}/resize", self.id),
            rows,
            cols,
        )
        .await
    }

    /// Block until the container stops; returns the engine's wait response.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if `timeout` elapses first.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Value> {
        let path = format!("containers/{}/wait", self.id);
        let wait = self.engine.http.request_json(Method::POST, &path, &[], None);
        match timeout {
            Some(limit) => error::with_timeout(limit, wait).await,
            None => wait.await,
        }
    }

    /// Resource usage. With `stream` the engine keeps sending samples.
    pub async fn stats(&self, stream: bool) -> Result<JsonLineStream<BodyReader>> {
        let response = self
            .engine
            .http
            .request(
                Method::GET,
                &format!("containers/{}/stats", self.id),
                &http::query([("stream", stream)]),
                None,
            )
            .await?;
        Ok(JsonLineStream::new(http::body_reader(response)))
    }
}

/// Result of [`Exec::start`].
#[derive(Debug)]
pub enum ExecStart {
    /// Detached run; the engine's (normally empty) response body.
    Detached(Bytes),
    /// Interactive session.
    Attached(HijackedTransport),
}

/// Handle on one exec instance.
#[derive(Debug, Clone)]
pub struct Exec {
    http: HttpClient,
    id: String,
    read_buffer: usize,
}

impl Exec {
    /// Exec instance id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Start the command.
    ///
    /// Attached starts perform the upgrade before returning, so a refused
    /// upgrade surfaces here as [`Error::UpgradeFailed`].
    pub async fn start(&self, detach: bool, tty: bool) -> Result<ExecStart> {
        let path = format!("exec/{}/start", self.id);
        let body = json!({ "Detach": detach, "Tty": tty });

        if detach {
            let response = self.http.request(Method::POST, &path, &[], Some(&body)).await?;
            return Ok(ExecStart::Detached(http::collect_body(response).await?));
        }

        let http = self.http.clone();
        let establisher = move || {
            let http = http.clone();
            let path = path.clone();
            let body = body.clone();
            async move {
                let upgraded = http.upgrade(Method::POST, &path, &[], Some(&body)).await?;
                Ok(Established {
                    connection: upgraded.connection,
                    tty,
                })
            }
        };

        let transport = HijackedTransport::new(format!("exec:{}", self.id), establisher)
            .with_read_buffer(self.read_buffer)
            .with_resizer(EndpointResizer {
                http: self.http.clone(),
                path: format!("exec/{}/resize", self.id),
            });
        transport.establish().await?;
        Ok(ExecStart::Attached(transport))
    }

    /// Resize the exec session's TTY.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        resize(&self.http, &format!("exec/{}/resize", self.id), rows, cols).await
    }

    /// Exec inspect document (running state, exit code).
    pub async fn inspect(&self) -> Result<Value> {
        self.http
            .request_json(Method::GET, &format!("exec/{}/json", self.id), &[], None)
            .await
    }
}

/// Image operations.
#[derive(Debug, Clone)]
pub struct Images {
    http: HttpClient,
}

impl Images {
    /// Pull an image and follow the progress messages.
    ///
    /// `image` may carry a tag (`alpine:3.19`) or digest; without either,
    /// `latest` is pulled.
    pub async fn pull(&self, image: &str) -> Result<JsonLineStream<BodyReader>> {
        let (name, tag) = split_image(image);
        let mut query = http::query([("fromImage", name)]);
        if let Some(tag) = tag {
            query.push(("tag".to_string(), tag.to_string()));
        }
        let response = self
            .http
            .request(Method::POST, "images/create", &query, None)
            .await?;
        Ok(JsonLineStream::new(http::body_reader(response)))
    }

    /// Push `name` (optionally only `tag`) to its registry and follow the
    /// progress messages.
    ///
    /// With `auth`, `name` must start with the registry host
    /// (`registry.example.com/team/app`).
    pub async fn push(
        &self,
        name: &str,
        tag: Option<&str>,
        auth: Option<&RegistryAuth>,
    ) -> Result<JsonLineStream<BodyReader>> {
        let header = match auth {
            Some(auth) => {
                let Some((registry, _)) = name.split_once('/') else {
                    return Err(Error::InvalidArgument(format!(
                        "image '{name}' needs a registry host when credentials are given"
                    )));
                };
                auth.for_registry(registry).header_value()?
            }
            // The engine rejects pushes without the header, even anonymous ones.
            None => "placeholder".to_string(),
        };
        let mut headers = HeaderMap::new();
        headers.insert("x-registry-auth", header_value(&header)?);

        let query = tag.map(|tag| http::query([("tag", tag)])).unwrap_or_default();
        let response = self
            .http
            .request_raw(
                Method::POST,
                &format!("images/{name}/push"),
                &query,
                headers,
                Bytes::new(),
            )
            .await?;
        Ok(JsonLineStream::new(http::body_reader(response)))
    }

    /// Build an image and follow the build output.
    ///
    /// The build context is either `context` (a tar archive, compressed as
    /// named by [`BuildOptions::encoding`]) or [`BuildOptions::remote`],
    /// never both.
    pub async fn build(
        &self,
        options: &BuildOptions,
        context: Option<Bytes>,
    ) -> Result<JsonLineStream<BodyReader>> {
        let query = options.to_query()?;
        let mut headers = HeaderMap::new();
        let body = match (context, &options.remote) {
            (None, None) => {
                return Err(Error::InvalidArgument(
                    "build needs either a context archive or a remote".to_string(),
                ));
            }
            (Some(_), Some(_)) => {
                return Err(Error::InvalidArgument(
                    "build takes a context archive or a remote, not both".to_string(),
                ));
            }
            (Some(context), None) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-tar"));
                if let Some(encoding) = &options.encoding {
                    headers.insert(CONTENT_ENCODING, header_value(encoding)?);
                }
                context
            }
            (None, Some(_)) => Bytes::new(),
        };

        let response = self
            .http
            .request_raw(Method::POST, "build", &query, headers, body)
            .await?;
        Ok(JsonLineStream::new(http::body_reader(response)))
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::InvalidArgument(format!("invalid header value '{value}': {e}")))
}

/// Registry credentials, sent base64-encoded in `X-Registry-Auth`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryAuth {
    /// Registry user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Registry password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Account email.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Registry address; filled in from the image name when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serveraddress: Option<String>,
    /// Token from a previous login, used instead of user/password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identitytoken: Option<String>,
}

impl RegistryAuth {
    /// Credentials for `username`/`password`.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            ..Self::default()
        }
    }

    fn for_registry(&self, registry: &str) -> Self {
        let mut auth = self.clone();
        if auth.identitytoken.is_none() && auth.serveraddress.is_none() {
            auth.serveraddress = Some(registry.to_string());
        }
        auth
    }

    /// Encoded header value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn header_value(&self) -> Result<String> {
        Ok(BASE64.encode(serde_json::to_vec(self)?))
    }
}

/// Options for [`Images::build`].
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Name and optional tag for the result (`t`).
    pub tag: Option<String>,
    /// Git repository or HTTP(S) context URL.
    pub remote: Option<String>,
    /// Dockerfile path within the context.
    pub dockerfile: Option<String>,
    /// Suppress verbose output.
    pub quiet: bool,
    /// Do not use the build cache.
    pub nocache: bool,
    /// Pull newer versions of base images.
    pub pull: bool,
    /// Remove intermediate containers after a successful build.
    pub rm: bool,
    /// Always remove intermediate containers.
    pub forcerm: bool,
    /// Build-time variables.
    pub buildargs: BTreeMap<String, String>,
    /// Labels set on the image.
    pub labels: BTreeMap<String, String>,
    /// Target platform, `os[/arch[/variant]]`.
    pub platform: Option<String>,
    /// `Content-Encoding` of the context archive (e.g. `gzip`).
    pub encoding: Option<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            tag: None,
            remote: None,
            dockerfile: None,
            quiet: false,
            nocache: false,
            pull: false,
            rm: true,
            forcerm: false,
            buildargs: BTreeMap::new(),
            labels: BTreeMap::new(),
            platform: None,
            encoding: None,
        }
    }
}

impl BuildOptions {
    fn to_query(&self) -> Result<Query> {
        let mut query = http::query([
            ("rm", self.rm),
            ("q", self.quiet),
            ("pull", self.pull),
            ("nocache", self.nocache),
            ("forcerm", self.forcerm),
        ]);
        let optional = [
            ("t", &self.tag),
            ("remote", &self.remote),
            ("dockerfile", &self.dockerfile),
            ("platform", &self.platform),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                query.push((key.to_string(), value.clone()));
            }
        }
        if !self.buildargs.is_empty() {
            query.push(("buildargs".to_string(), serde_json::to_string(&self.buildargs)?));
        }
        if !self.labels.is_empty() {
            query.push(("labels".to_string(), serde_json::to_string(&self.labels)?));
        }
        Ok(query)
    }
}

/// Split `name[:tag]`, defaulting to `latest`. Digests are left alone.
fn split_image(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    let last_segment = image.rfind('/').map_or(0, |i| i + 1);
    match image[last_segment..].rfind(':') {
        Some(i) => {
            let split = last_segment + i;
            (&image[..split], Some(&image[split + 1..]))
        }
        None => (image, Some("latest")),
    }
}

struct EndpointResizer {
    http: HttpClient,
    path: String,
}

#[async_trait]
impl Resize for EndpointResizer {
    async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        resize(&self.http, &self.path, rows, cols).await
    }
}

async fn resize(http: &HttpClient, path: &str, rows: u16, cols: u16) -> Result<()> {
    let response = http
        .request(Method::POST, path, &http::query([("h", rows), ("w", cols)]), None)
        .await?;
    http::collect_body(response).await.map(|_| ())
}

async fn inspect(http: &HttpClient, id: &str) -> Result<Value> {
    http.request_json(Method::GET, &format!("containers/{id}/json"), &[], None)
        .await
}

async fn inspect_tty(http: &HttpClient, id: &str) -> Result<bool> {
    Ok(inspect(http, id)
        .await?
        .pointer("/Config/Tty")
        .and_then(Value::as_bool)
        .unwrap_or(false))
}

/// Open a container's log body, decoding by the container's TTY setting.
pub(crate) async fn open_logs(
    http: &HttpClient,
    id: &str,
    options: &LogOptions,
) -> Result<MultiplexedResult<BodyReader>> {
    let query = options.to_query()?;
    let tty = inspect_tty(http, id).await?;
    let response = http
        .request(Method::GET, &format!("containers/{id}/logs"), &query, None)
        .await?;
    Ok(MultiplexedResult::new(http::body_reader(response), tty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    #[test]
    fn test_registry_auth_header() {
        let auth = RegistryAuth::basic("me", "secret").for_registry("registry.local");
        let decoded = BASE64.decode(auth.header_value().unwrap()).unwrap();
        let value: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(
            value,
            json!({"username": "me", "password": "secret", "serveraddress": "registry.local"})
        );

        let token = RegistryAuth {
            identitytoken: Some("tok".to_string()),
            ..RegistryAuth::default()
        };
        assert!(token.for_registry("registry.local").serveraddress.is_none());
    }

    #[test]
    fn test_build_query() {
        let options = BuildOptions {
            tag: Some("app:dev".to_string()),
            buildargs: BTreeMap::from([("VERSION".to_string(), "1".to_string())]),
            ..BuildOptions::default()
        };
        let query = options.to_query().unwrap();
        assert!(query.contains(&("rm".to_string(), "true".to_string())));
        assert!(query.contains(&("t".to_string(), "app:dev".to_string())));
        assert!(query.contains(&("buildargs".to_string(), "{\"VERSION\":\"1\"}".to_string())));
        assert!(!query.iter().any(|(key, _)| key == "remote" || key == "labels"));
    }

    #[test]
    fn test_split_image() {
        assert_eq!(split_image("alpine"), ("alpine", Some("latest")));
        assert_eq!(split_image("alpine:3.19"), ("alpine", Some("3.19")));
        assert_eq!(
            split_image("localhost:5000/team/app"),
            ("localhost:5000/team/app", Some("latest"))
        );
        assert_eq!(
            split_image("localhost:5000/app:dev"),
            ("localhost:5000/app", Some("dev"))
        );
        assert_eq!(split_image("alpine@sha256:abc"), ("alpine@sha256:abc", None));
    }

    #[test]
    fn test_log_query_defaults() {
        let query = LogOptions::default().to_query().unwrap();
        assert!(query.contains(&("stdout".to_string(), "true".to_string())));
        assert!(query.contains(&("stderr".to_string(), "true".to_string())));
        assert!(query.contains(&("follow".to_string(), "false".to_string())));
    }

    #[test]
    fn test_log_query_requires_a_stream() {
        let options = LogOptions {
            stdout: false,
            stderr: false,
            ..LogOptions::default()
        };
        assert!(matches!(options.to_query(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_attach_query() {
        let query = AttachOptions {
            stdin: true,
            detach_keys: Some("ctrl-p,ctrl-q".to_string()),
            ..AttachOptions::default()
        }
        .to_query();
        assert!(query.contains(&("stream".to_string(), "true".to_string())));
        assert!(query.contains(&("stdin".to_string(), "true".to_string())));
        assert!(query.contains(&("detachKeys".to_string(), "ctrl-p,ctrl-q".to_string())));
    }

    #[test]
    fn test_exec_config_serialization() {
        let config = ExecConfig {
            tty: true,
            ..ExecConfig::new(["sh", "-c", "echo hi"])
        };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["Cmd"], json!(["sh", "-c", "echo hi"]));
        assert_eq!(value["AttachStdout"], json!(true));
        assert_eq!(value["Tty"], json!(true));
        assert!(value.get("User").is_none());
        assert!(value.get("Env").is_none());
    }
}
