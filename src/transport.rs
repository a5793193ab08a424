use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::endpoint::{AgentEndpoint, Transport};
use crate::error::{Error, UploadError};

/// A prepared profile upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Absolute URL to POST to.
    pub url: String,
    /// `multipart/form-data` content type, including the boundary.
    pub content_type: String,
    /// Encoded multipart body.
    pub body: Vec<u8>,
    /// Basic auth credentials, set only when both server id and token are
    /// configured.
    pub basic_auth: Option<(String, String)>,
}

/// Status of the agent's answer to an upload.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub status: u16,
    /// Status line remainder, e.g. `500 Internal Server Error`.
    pub status_line: String,
}

/// The dialing layer underneath the uploader.
///
/// The default implementation routes to the configured UNIX socket or TCP
/// address, or speaks plain http(s) in agentless mode. Not part of the
/// public API: tests swap in mocks through the hidden `with_http_client`
/// option.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: UploadRequest) -> Result<AgentResponse>;
}

/// Outcome of a single dispatched upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PostStatus {
    Uploaded,
    /// Shutdown fired while the request was in flight; the batch was
    /// abandoned intentionally.
    Interrupted,
}

/// Wraps the dialing client with credentials, the per-request timeout, and
/// response classification.
pub(crate) struct AgentClient {
    client: Arc<dyn HttpClient>,
    endpoint: String,
    credentials: Option<(String, String)>,
    upload_timeout: Duration,
}

impl AgentClient {
    pub(crate) fn new(
        client: Arc<dyn HttpClient>,
        endpoint: String,
        credentials: Option<(String, String)>,
        upload_timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoint,
            credentials,
            upload_timeout,
        }
    }

    /// POSTs one encoded batch. The in-flight request is bounded by the
    /// upload timeout and aborted by shutdown.
    pub(crate) async fn post(
        &self,
        content_type: &str,
        body: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<PostStatus, UploadError> {
        debug!(endpoint = %self.endpoint, "Uploading profile");

        let request = UploadRequest {
            url: self.endpoint.clone(),
            content_type: content_type.to_string(),
            body,
            basic_auth: self.credentials.clone(),
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(PostStatus::Interrupted),
            outcome = tokio::time::timeout(self.upload_timeout, self.client.execute(request)) => {
                match outcome {
                    Err(_) => {
                        return Err(UploadError::Retriable(format!(
                            "upload timed out after {:?}",
                            self.upload_timeout
                        )))
                    }
                    Ok(Err(e)) => {
                        let text = format!("{e:#}");
                        if text.contains("malformed HTTP version") {
                            return Err(UploadError::OldAgent);
                        }
                        return Err(UploadError::Retriable(text));
                    }
                    Ok(Ok(response)) => response,
                }
            }
        };

        match response.status {
            200..=299 => Ok(PostStatus::Uploaded),
            404 => Err(UploadError::OldAgent),
            _ => Err(UploadError::Protocol(response.status_line)),
        }
    }
}

/// Default dialing client. Agent transports (UNIX socket, TCP loopback) get
/// a direct HTTP/1.1 conversation over the dialed stream so a pre-profiling
/// agent's non-HTTP banner is observable as a malformed version on either
/// dial kind; reqwest only handles agentless http(s) endpoints.
pub(crate) enum DefaultHttpClient {
    Direct(reqwest::Client),
    Tcp(String),
    #[cfg(unix)]
    Unix(std::path::PathBuf),
}

impl DefaultHttpClient {
    pub(crate) fn new(endpoint: &AgentEndpoint) -> Result<Self, Error> {
        match &endpoint.transport {
            Transport::Unix(path) => {
                #[cfg(unix)]
                {
                    Ok(Self::Unix(path.clone()))
                }
                #[cfg(not(unix))]
                {
                    let _ = path;
                    Err(Error::Config(
                        "unix agent sockets are not supported on this platform".to_string(),
                    ))
                }
            }
            Transport::Tcp(address) => Ok(Self::Tcp(address.clone())),
            Transport::Direct => reqwest::Client::builder()
                .build()
                .map(Self::Direct)
                .map_err(|e| Error::Config(format!("could not build HTTP client: {e}"))),
        }
    }
}

#[async_trait]
impl HttpClient for DefaultHttpClient {
    async fn execute(&self, request: UploadRequest) -> Result<AgentResponse> {
        match self {
            Self::Direct(client) => execute_direct(client, request).await,
            Self::Tcp(address) => execute_tcp(address, request).await,
            #[cfg(unix)]
            Self::Unix(path) => execute_unix(path, request).await,
        }
    }
}

async fn execute_direct(
    client: &reqwest::Client,
    request: UploadRequest,
) -> Result<AgentResponse> {
    let mut builder = client
        .post(&request.url)
        .header(reqwest::header::CONTENT_TYPE, &request.content_type)
        .body(request.body);

    if let Some((id, token)) = &request.basic_auth {
        builder = builder.basic_auth(id, Some(token));
    }

    let response = builder
        .send()
        .await
        .context("sending profile upload request")?;

    let status = response.status();
    // Drain the body so the connection can be reused.
    let _ = response.bytes().await;

    Ok(AgentResponse {
        status: status.as_u16(),
        status_line: status_line(status.as_u16(), status.canonical_reason().unwrap_or("")),
    })
}

async fn execute_tcp(address: &str, request: UploadRequest) -> Result<AgentResponse> {
    let stream = tokio::net::TcpStream::connect(address)
        .await
        .with_context(|| format!("connecting to agent at {address}"))?;

    execute_raw(stream, address, request).await
}

#[cfg(unix)]
async fn execute_unix(
    path: &std::path::Path,
    request: UploadRequest,
) -> Result<AgentResponse> {
    let stream = tokio::net::UnixStream::connect(path)
        .await
        .with_context(|| format!("connecting to agent socket {}", path.display()))?;

    execute_raw(stream, "unix", request).await
}

/// Speaks one HTTP/1.1 request over an already-dialed agent stream and
/// classifies the status line. Both agent transports go through here so the
/// malformed-version detection behaves the same on either dial kind.
async fn execute_raw<S>(mut stream: S, host: &str, request: UploadRequest) -> Result<AgentResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = format!(
        "POST {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n",
        url_path(&request.url),
        host,
        request.content_type,
        request.body.len(),
    );
    if let Some((id, token)) = &request.basic_auth {
        let credentials =
            base64::engine::general_purpose::STANDARD.encode(format!("{id}:{token}"));
        head.push_str(&format!("Authorization: Basic {credentials}\r\n"));
    }
    head.push_str("\r\n");

    stream
        .write_all(head.as_bytes())
        .await
        .context("writing request header to agent")?;
    stream
        .write_all(&request.body)
        .await
        .context("writing request body to agent")?;
    stream
        .flush()
        .await
        .context("flushing request to agent")?;

    // `Connection: close` was requested, so the agent ends the response by
    // closing its side.
    let mut raw = Vec::with_capacity(512);
    stream
        .read_to_end(&mut raw)
        .await
        .context("reading agent response")?;

    let header_text = String::from_utf8_lossy(&raw);
    let first_line = header_text.lines().next().unwrap_or_default();
    let (status, status_line) = parse_status_line(first_line)?;

    Ok(AgentResponse {
        status,
        status_line,
    })
}

/// Extracts the request path from an absolute URL.
fn url_path(url: &str) -> &str {
    url.split_once("://")
        .map(|(_, rest)| rest)
        .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
        .unwrap_or("/")
}

/// Parses `HTTP/1.x NNN Reason`. An agent predating continuous profiling
/// answers with its own line protocol here, which shows up as a malformed
/// HTTP version and gets classified as an old agent upstream.
fn parse_status_line(line: &str) -> Result<(u16, String)> {
    let mut parts = line.splitn(3, ' ');

    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        bail!("malformed HTTP version in agent response: {line:?}");
    }

    let code = parts
        .next()
        .with_context(|| format!("missing status code in agent response: {line:?}"))?;
    let status: u16 = code
        .parse()
        .with_context(|| format!("invalid status code in agent response: {line:?}"))?;

    let reason = parts.next().unwrap_or("");
    Ok((status, status_line(status, reason)))
}

fn status_line(status: u16, reason: &str) -> String {
    if reason.is_empty() {
        status.to_string()
    } else {
        format!("{status} {reason}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClient {
        status: u16,
        reason: &'static str,
    }

    #[async_trait]
    impl HttpClient for FixedClient {
        async fn execute(&self, _request: UploadRequest) -> Result<AgentResponse> {
            Ok(AgentResponse {
                status: self.status,
                status_line: status_line(self.status, self.reason),
            })
        }
    }

    struct FailingClient {
        message: &'static str,
    }

    #[async_trait]
    impl HttpClient for FailingClient {
        async fn execute(&self, _request: UploadRequest) -> Result<AgentResponse> {
            bail!("{}", self.message)
        }
    }

    struct HangingClient;

    #[async_trait]
    impl HttpClient for HangingClient {
        async fn execute(&self, _request: UploadRequest) -> Result<AgentResponse> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            bail!("unreachable")
        }
    }

    fn agent(client: Arc<dyn HttpClient>, timeout: Duration) -> AgentClient {
        AgentClient::new(
            client,
            "http://unix/profiling/v1/input".to_string(),
            None,
            timeout,
        )
    }

    #[tokio::test]
    async fn test_post_2xx_succeeds() {
        let cancel = CancellationToken::new();
        for status in [200u16, 204, 299] {
            let client = agent(
                Arc::new(FixedClient { status, reason: "OK" }),
                Duration::from_secs(1),
            );
            let outcome = client
                .post("multipart/form-data; boundary=x", Vec::new(), &cancel)
                .await
                .expect("post succeeds");
            assert_eq!(outcome, PostStatus::Uploaded);
        }
    }

    #[tokio::test]
    async fn test_post_404_is_old_agent() {
        let cancel = CancellationToken::new();
        let client = agent(
            Arc::new(FixedClient {
                status: 404,
                reason: "Not Found",
            }),
            Duration::from_secs(1),
        );
        let err = client
            .post("multipart/form-data; boundary=x", Vec::new(), &cancel)
            .await
            .expect_err("should fail");
        assert!(matches!(err, UploadError::OldAgent));
        assert!(err.to_string().contains("Blackfire Agent >= 2.13.0"));
    }

    #[tokio::test]
    async fn test_post_other_status_is_protocol_error() {
        let cancel = CancellationToken::new();
        let client = agent(
            Arc::new(FixedClient {
                status: 500,
                reason: "Internal Server Error",
            }),
            Duration::from_secs(1),
        );
        let err = client
            .post("multipart/form-data; boundary=x", Vec::new(), &cancel)
            .await
            .expect_err("should fail");
        match err {
            UploadError::Protocol(line) => assert_eq!(line, "500 Internal Server Error"),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_post_transport_error_is_retriable() {
        let cancel = CancellationToken::new();
        let client = agent(
            Arc::new(FailingClient {
                message: "connection reset by peer",
            }),
            Duration::from_secs(1),
        );
        let err = client
            .post("multipart/form-data; boundary=x", Vec::new(), &cancel)
            .await
            .expect_err("should fail");
        match err {
            UploadError::Retriable(msg) => assert!(msg.contains("connection reset")),
            other => panic!("expected retriable error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_post_malformed_version_is_old_agent() {
        let cancel = CancellationToken::new();
        let client = agent(
            Arc::new(FailingClient {
                message: "malformed HTTP version \"BLACKFIRE\"",
            }),
            Duration::from_secs(1),
        );
        let err = client
            .post("multipart/form-data; boundary=x", Vec::new(), &cancel)
            .await
            .expect_err("should fail");
        assert!(matches!(err, UploadError::OldAgent));
    }

    #[tokio::test]
    async fn test_post_timeout_is_retriable() {
        let cancel = CancellationToken::new();
        let client = agent(Arc::new(HangingClient), Duration::from_millis(50));
        let err = client
            .post("multipart/form-data; boundary=x", Vec::new(), &cancel)
            .await
            .expect_err("should fail");
        match err {
            UploadError::Retriable(msg) => assert!(msg.contains("timed out")),
            other => panic!("expected retriable error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_post_cancelled_is_interrupted() {
        let cancel = CancellationToken::new();
        let client = agent(Arc::new(HangingClient), Duration::from_secs(60));

        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let outcome = client
            .post("multipart/form-data; boundary=x", Vec::new(), &cancel)
            .await
            .expect("interrupted is not an error");
        assert_eq!(outcome, PostStatus::Interrupted);
    }

    #[test]
    fn test_parse_status_line() {
        let (status, line) = parse_status_line("HTTP/1.1 200 OK").expect("valid line");
        assert_eq!(status, 200);
        assert_eq!(line, "200 OK");

        let (status, line) =
            parse_status_line("HTTP/1.0 500 Internal Server Error").expect("valid line");
        assert_eq!(status, 500);
        assert_eq!(line, "500 Internal Server Error");

        let err = parse_status_line("BLACKFIRE 1.0 HELLO").expect_err("not HTTP");
        assert!(err.to_string().contains("malformed HTTP version"));

        assert!(parse_status_line("HTTP/1.1").is_err());
        assert!(parse_status_line("HTTP/1.1 abc OK").is_err());
    }

    #[test]
    fn test_url_path() {
        assert_eq!(url_path("http://unix/profiling/v1/input"), "/profiling/v1/input");
        assert_eq!(url_path("http://127.0.0.1:8307/profiling/v1/input"), "/profiling/v1/input");
        assert_eq!(url_path("http://hostonly"), "/");
    }

    /// Reads one full HTTP request (headers plus `Content-Length` body) from
    /// a test server's accepted stream.
    async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
        let mut raw = Vec::new();
        let mut chunk = [0u8; 4096];

        loop {
            let n = stream.read(&mut chunk).await.expect("read request");
            assert!(n > 0, "client closed before request completed");
            raw.extend_from_slice(&chunk[..n]);

            let Some(header_end) = raw.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };

            let headers = String::from_utf8_lossy(&raw[..header_end]).to_string();
            let content_length = headers
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);

            if raw.len() >= header_end + 4 + content_length {
                return raw;
            }
        }
    }

    mod tcp_socket {
        use tokio::io::AsyncWriteExt;
        use tokio::net::TcpListener;

        use super::*;

        #[tokio::test]
        async fn test_tcp_round_trip() {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
            let address = listener.local_addr().expect("local addr").to_string();

            let server = tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.expect("accept");
                let raw = read_request(&mut stream).await;
                stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await
                    .expect("write response");
                raw
            });

            let client = DefaultHttpClient::Tcp(address.clone());
            let response = client
                .execute(UploadRequest {
                    url: format!("http://{address}/profiling/v1/input"),
                    content_type: "multipart/form-data; boundary=abc".to_string(),
                    body: b"hello".to_vec(),
                    basic_auth: None,
                })
                .await
                .expect("request succeeds");

            assert_eq!(response.status, 200);

            let raw = server.await.expect("server join");
            let text = String::from_utf8_lossy(&raw);
            assert!(text.starts_with("POST /profiling/v1/input HTTP/1.1\r\n"));
            assert!(text.contains(&format!("Host: {address}\r\n")));
            assert!(text.contains("Content-Length: 5\r\n"));
            assert!(text.ends_with("\r\n\r\nhello"));
        }

        #[tokio::test]
        async fn test_tcp_non_http_response() {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
            let address = listener.local_addr().expect("local addr").to_string();

            tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.expect("accept");
                let _ = read_request(&mut stream).await;
                stream
                    .write_all(b"BLACKFIRE\tagent\r\n")
                    .await
                    .expect("write response");
            });

            let client = DefaultHttpClient::Tcp(address.clone());
            let err = client
                .execute(UploadRequest {
                    url: format!("http://{address}/profiling/v1/input"),
                    content_type: "multipart/form-data; boundary=abc".to_string(),
                    body: Vec::new(),
                    basic_auth: None,
                })
                .await
                .expect_err("should fail");

            assert!(format!("{err:#}").contains("malformed HTTP version"));
        }

        #[tokio::test]
        async fn test_tcp_non_http_response_classifies_as_old_agent() {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
            let address = listener.local_addr().expect("local addr").to_string();

            tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.expect("accept");
                let _ = read_request(&mut stream).await;
                stream
                    .write_all(b"BLACKFIRE\tagent\r\n")
                    .await
                    .expect("write response");
            });

            let agent = AgentClient::new(
                Arc::new(DefaultHttpClient::Tcp(address.clone())),
                format!("http://{address}/profiling/v1/input"),
                None,
                Duration::from_secs(1),
            );

            let cancel = CancellationToken::new();
            let err = agent
                .post("multipart/form-data; boundary=abc", Vec::new(), &cancel)
                .await
                .expect_err("should fail");
            assert!(matches!(err, UploadError::OldAgent));
        }
    }

    #[cfg(unix)]
    mod unix_socket {
        use tokio::io::AsyncWriteExt;
        use tokio::net::UnixListener;

        use super::*;

        fn socket_path(tag: &str) -> std::path::PathBuf {
            use rand::Rng;

            let nonce: u32 = rand::thread_rng().gen();
            std::env::temp_dir().join(format!("conprof-test-{tag}-{}-{nonce}.sock", std::process::id()))
        }

        #[tokio::test]
        async fn test_unix_round_trip() {
            let path = socket_path("ok");
            let listener = UnixListener::bind(&path).expect("bind test socket");

            let server = tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.expect("accept");
                let raw = read_request(&mut stream).await;
                stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await
                    .expect("write response");
                raw
            });

            let client = DefaultHttpClient::Unix(path.clone());
            let response = client
                .execute(UploadRequest {
                    url: "http://unix/profiling/v1/input".to_string(),
                    content_type: "multipart/form-data; boundary=abc".to_string(),
                    body: b"hello".to_vec(),
                    basic_auth: Some(("id".to_string(), "token".to_string())),
                })
                .await
                .expect("request succeeds");

            assert_eq!(response.status, 200);

            let raw = server.await.expect("server join");
            let text = String::from_utf8_lossy(&raw);
            assert!(text.starts_with("POST /profiling/v1/input HTTP/1.1\r\n"));
            assert!(text.contains("Content-Type: multipart/form-data; boundary=abc\r\n"));
            assert!(text.contains("Content-Length: 5\r\n"));
            // base64("id:token")
            assert!(text.contains("Authorization: Basic aWQ6dG9rZW4=\r\n"));
            assert!(text.ends_with("\r\n\r\nhello"));

            let _ = std::fs::remove_file(&path);
        }

        #[tokio::test]
        async fn test_unix_non_http_response() {
            let path = socket_path("oldagent");
            let listener = UnixListener::bind(&path).expect("bind test socket");

            tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.expect("accept");
                let _ = read_request(&mut stream).await;
                stream
                    .write_all(b"BLACKFIRE\tagent\r\n")
                    .await
                    .expect("write response");
            });

            let client = DefaultHttpClient::Unix(path.clone());
            let err = client
                .execute(UploadRequest {
                    url: "http://unix/profiling/v1/input".to_string(),
                    content_type: "multipart/form-data; boundary=abc".to_string(),
                    body: Vec::new(),
                    basic_auth: None,
                })
                .await
                .expect_err("should fail");

            assert!(format!("{err:#}").contains("malformed HTTP version"));

            let _ = std::fs::remove_file(&path);
        }

        #[tokio::test]
        async fn test_unix_connect_failure_is_error() {
            let client = DefaultHttpClient::Unix(socket_path("missing"));
            let err = client
                .execute(UploadRequest {
                    url: "http://unix/profiling/v1/input".to_string(),
                    content_type: "multipart/form-data; boundary=abc".to_string(),
                    body: Vec::new(),
                    basic_auth: None,
                })
                .await
                .expect_err("should fail");
            assert!(format!("{err:#}").contains("connecting to agent socket"));
        }
    }
}
