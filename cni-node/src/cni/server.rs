use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use http::{Method, StatusCode, Uri, header};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::cni::handler::CniHandler;
use crate::cni::{PodRequest, Request};
use crate::http::shutdown;
use crate::metrics::CNI_METRICS;
use crate::{Error, Result};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Serves CNI requests over HTTP on a local unix socket.
///
/// Every accepted connection is handled on its own task. [`Server::stop`]
/// stops accepting immediately and then waits for in-flight requests to
/// finish before removing the socket.
pub struct Server {
    socket_path: PathBuf,
    request_timeout: Duration,
    cancel: CancellationToken,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Server {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds the socket and starts serving. Bind errors are returned here,
    /// request errors are only ever reported to the client.
    pub async fn start<H: CniHandler>(&mut self, handler: H, ctx: H::Context) -> Result<()> {
        if self.handle.is_some() || self.cancel.is_cancelled() {
            return Err(Error::Other("cni server can only be started once".into()));
        }
        let listener = bind(&self.socket_path).await?;
        info!("cni server listening on {}", self.socket_path.display());

        let dispatcher = Arc::new(Dispatcher {
            handler,
            ctx,
            timeout: self.request_timeout,
        });
        let app = router(dispatcher);
        let cancel = self.cancel.child_token();
        self.handle = Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown(cancel))
                .await?;
            Ok(())
        }));
        Ok(())
    }

    /// Stops the server and waits for in-flight requests to drain.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        // the socket belongs to whoever bound it, which may be another server
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let out = handle
            .await
            .map_err(|e| Error::Task(e.to_string()))
            .and_then(|served| served);
        if let Err(e) = fs::remove_file(&self.socket_path)
            && e.kind() != ErrorKind::NotFound
        {
            warn!(%e, "failed to remove socket {}", self.socket_path.display());
        }
        info!("cni server stopped");
        out
    }
}

async fn bind(path: &Path) -> Result<UnixListener> {
    // a socket that still accepts connections belongs to a running server
    if UnixStream::connect(path).await.is_ok() {
        return Err(Error::SocketInUse(path.display().to_string()));
    }
    if let Err(e) = fs::remove_file(path)
        && e.kind() != ErrorKind::NotFound
    {
        return Err(e.into());
    }
    let Some(parent) = path.parent() else {
        return Err(std::io::Error::new(
            ErrorKind::NotFound,
            format!("parent of path {} could not resolve", path.display()),
        )
        .into());
    };
    fs::create_dir_all(parent)?;
    let listener = UnixListener::bind(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

struct Dispatcher<H: CniHandler> {
    handler: H,
    ctx: H::Context,
    timeout: Duration,
}

impl<H: CniHandler> Dispatcher<H> {
    async fn process(&self, request: PodRequest) -> Result<Vec<u8>> {
        match tokio::time::timeout(self.timeout, self.handler.handle(&request, &self.ctx)).await {
            Ok(out) => out,
            Err(_) => Err(Error::HandlerTimeout(self.timeout)),
        }
    }
}

fn router<H: CniHandler>(dispatcher: Arc<Dispatcher<H>>) -> Router {
    Router::new()
        .route("/", post(handle_cni::<H>).fallback(unsupported))
        .fallback(unsupported)
        .with_state(dispatcher)
}

async fn unsupported(method: Method, uri: Uri) -> Reply {
    warn!("rejected unsupported request {method} {uri}");
    Reply::Failure(format!("unsupported request {method} {uri}"))
}

async fn handle_cni<H: CniHandler>(
    State(dispatcher): State<Arc<Dispatcher<H>>>,
    body: Bytes,
) -> Reply {
    let _timer = CNI_METRICS.measure();
    let request = match Request::from_slice(&body).and_then(PodRequest::try_from) {
        Ok(request) => request,
        Err(e) => {
            let e = Error::from(e);
            warn!(%e, "rejected cni request");
            CNI_METRICS.count("unknown", Some(&e));
            return Reply::Failure(e.to_string());
        }
    };

    let command = request.command;
    let span = info_span!(
        "cni",
        command = %command,
        container_id = %request.container_id,
        pod = %format!("{}/{}", request.pod_namespace, request.pod_name),
    );
    async move {
        info!("processing cni request");
        match dispatcher.process(request).await {
            Ok(out) => {
                CNI_METRICS.count(command.as_str(), None);
                info!("cni request succeeded");
                Reply::Success(out)
            }
            Err(e) => {
                CNI_METRICS.count(command.as_str(), Some(&e));
                error!(%e, "cni request failed");
                Reply::Failure(e.to_string())
            }
        }
    }
    .instrument(span)
    .await
}

enum Reply {
    Success(Vec<u8>),
    Failure(String),
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self {
            Reply::Success(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response(),
            Reply::Failure(message) => (
                StatusCode::BAD_REQUEST,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                message,
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use http_body_util::{BodyExt, Full};
    use hyper::Request as HttpRequest;
    use hyper_util::rt::TokioIo;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::cni::Command;
    use crate::cni::request::{CNI_ARGS, CNI_COMMAND, CNI_CONTAINERID, CNI_NETNS};

    const SANDBOX_ID: &str = "adsfadsfasfdasdfasf";
    const CNI_CONFIG: &str = r#"{"cniVersion": "0.1.0","name": "ovnkube","type": "ovnkube"}"#;

    fn expected_result() -> Value {
        json!({"ip4": {"ip": "10.0.0.2/24"}, "dns": {}})
    }

    /// Records the requests it sees in the shared context.
    struct TestHandler;

    #[derive(Default)]
    struct TestContext {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CniHandler for TestHandler {
        type Context = TestContext;

        async fn handle(&self, request: &PodRequest, ctx: &TestContext) -> Result<Vec<u8>> {
            ctx.calls.fetch_add(1, Ordering::SeqCst);
            match request.command {
                Command::Add => Ok(serde_json::to_vec(&expected_result())?),
                Command::Delete | Command::Update | Command::Check => Ok(vec![]),
            }
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl CniHandler for SlowHandler {
        type Context = ();

        async fn handle(&self, _request: &PodRequest, _ctx: &()) -> Result<Vec<u8>> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(b"done".to_vec())
        }
    }

    fn cni_args(namespace: &str, name: &str) -> String {
        format!("K8S_POD_NAMESPACE={namespace};K8S_POD_NAME={name}")
    }

    fn request(env: &[(&str, &str)], config: &str) -> Vec<u8> {
        let req = Request {
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            config: config.as_bytes().to_vec(),
        };
        serde_json::to_vec(&req).unwrap()
    }

    async fn post_unix(path: &Path, body: Vec<u8>) -> (StatusCode, Vec<u8>) {
        let stream = UnixStream::connect(path).await.unwrap();
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        tokio::spawn(conn);

        let req = HttpRequest::post("/")
            .header(header::HOST, "localhost")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(bytes::Bytes::from(body)))
            .unwrap();
        let resp = sender.send_request(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    #[tokio::test]
    async fn test_cni_server() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("cni-server.sock");
        let mut server = Server::new(&socket_path);
        server.start(TestHandler, TestContext::default()).await.unwrap();

        let args = cni_args("awesome-namespace", "awesome-name");
        struct Case<'a> {
            name: &'a str,
            env: Vec<(&'a str, &'a str)>,
            result: Option<Value>,
            error_prefix: Option<&'a str>,
        }
        let cases = vec![
            Case {
                name: "ADD",
                env: vec![
                    (CNI_COMMAND, "ADD"),
                    (CNI_CONTAINERID, SANDBOX_ID),
                    (CNI_NETNS, "/path/to/something"),
                    (CNI_ARGS, args.as_str()),
                ],
                result: Some(expected_result()),
                error_prefix: None,
            },
            Case {
                name: "DEL",
                env: vec![
                    (CNI_COMMAND, "DEL"),
                    (CNI_CONTAINERID, SANDBOX_ID),
                    (CNI_NETNS, "/path/to/something"),
                    (CNI_ARGS, args.as_str()),
                ],
                result: None,
                error_prefix: None,
            },
            Case {
                name: "UPDATE",
                env: vec![
                    (CNI_COMMAND, "UPDATE"),
                    (CNI_CONTAINERID, SANDBOX_ID),
                    (CNI_NETNS, "/path/to/something"),
                    (CNI_ARGS, args.as_str()),
                ],
                result: None,
                error_prefix: None,
            },
            Case {
                name: "CHECK",
                env: vec![
                    (CNI_COMMAND, "CHECK"),
                    (CNI_CONTAINERID, SANDBOX_ID),
                    (CNI_NETNS, "/path/to/something"),
                    (CNI_ARGS, args.as_str()),
                ],
                result: None,
                error_prefix: None,
            },
            Case {
                name: "missing args",
                env: vec![
                    (CNI_COMMAND, "ADD"),
                    (CNI_CONTAINERID, SANDBOX_ID),
                    (CNI_NETNS, "/path/to/something"),
                ],
                result: None,
                error_prefix: Some("missing CNI_ARGS"),
            },
            Case {
                name: "missing netns",
                env: vec![
                    (CNI_COMMAND, "ADD"),
                    (CNI_CONTAINERID, SANDBOX_ID),
                    (CNI_ARGS, args.as_str()),
                ],
                result: None,
                error_prefix: Some("missing CNI_NETNS"),
            },
            Case {
                name: "missing command",
                env: vec![
                    (CNI_CONTAINERID, SANDBOX_ID),
                    (CNI_NETNS, "/path/to/something"),
                    (CNI_ARGS, args.as_str()),
                ],
                result: None,
                error_prefix: Some("unexpected or missing CNI_COMMAND"),
            },
        ];

        for case in cases {
            let (status, body) = post_unix(&socket_path, request(&case.env, CNI_CONFIG)).await;
            match case.error_prefix {
                None => {
                    assert_eq!(status, StatusCode::OK, "[{}]", case.name);
                    match &case.result {
                        Some(expected) => {
                            let got: Value = serde_json::from_slice(&body).unwrap();
                            assert_eq!(&got, expected, "[{}]", case.name);
                        }
                        None => assert!(body.is_empty(), "[{}] body {:?}", case.name, body),
                    }
                }
                Some(prefix) => {
                    assert_eq!(status, StatusCode::BAD_REQUEST, "[{}]", case.name);
                    let body = String::from_utf8(body).unwrap();
                    assert!(
                        body.starts_with(prefix),
                        "[{}] unexpected error message '{}'",
                        case.name,
                        body
                    );
                }
            }
        }

        server.stop().await.unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_invalid_requests_never_reach_handler() {
        let dispatcher = Arc::new(Dispatcher {
            handler: TestHandler,
            ctx: TestContext::default(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        });
        let app = router(dispatcher.clone());

        let resp = app
            .clone()
            .oneshot(
                HttpRequest::post("/")
                    .body(axum::body::Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(body.starts_with(b"invalid CNI request"));

        let resp = app
            .oneshot(
                HttpRequest::post("/")
                    .body(axum::body::Body::from(request(
                        &[(CNI_COMMAND, "ADD"), (CNI_NETNS, "/ns")],
                        CNI_CONFIG,
                    )))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(body.starts_with(b"missing CNI_CONTAINERID"));

        assert_eq!(dispatcher.ctx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_timeout() {
        let dispatcher = Arc::new(Dispatcher {
            handler: SlowHandler,
            ctx: (),
            timeout: Duration::from_millis(10),
        });
        let args = cni_args("ns", "pod");
        let resp = router(dispatcher)
            .oneshot(
                HttpRequest::post("/")
                    .body(axum::body::Body::from(request(
                        &[
                            (CNI_COMMAND, "DEL"),
                            (CNI_CONTAINERID, SANDBOX_ID),
                            (CNI_ARGS, args.as_str()),
                        ],
                        CNI_CONFIG,
                    )))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"handler timed out after 10ms");
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("run").join("cni-server.sock");
        fs::create_dir_all(socket_path.parent().unwrap()).unwrap();
        // leftover from a previous run, nothing listens on it anymore
        drop(std::os::unix::net::UnixListener::bind(&socket_path).unwrap());
        assert!(socket_path.exists());

        let mut server = Server::new(&socket_path);
        server.start(TestHandler, TestContext::default()).await.unwrap();

        let mut second = Server::new(&socket_path);
        let err = second
            .start(TestHandler, TestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SocketInUse(_)));

        server.stop().await.unwrap();
        assert!(UnixStream::connect(&socket_path).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_start_leaves_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("cni-server.sock");
        let mut live = Server::new(&socket_path);
        live.start(TestHandler, TestContext::default()).await.unwrap();

        let mut second = Server::new(&socket_path);
        assert!(
            second
                .start(TestHandler, TestContext::default())
                .await
                .is_err()
        );
        second.stop().await.unwrap();

        assert!(socket_path.exists());
        let args = cni_args("ns", "pod");
        let body = request(
            &[
                (CNI_COMMAND, "DEL"),
                (CNI_CONTAINERID, SANDBOX_ID),
                (CNI_ARGS, args.as_str()),
            ],
            CNI_CONFIG,
        );
        let (status, _) = post_unix(&socket_path, body).await;
        assert_eq!(status, StatusCode::OK);

        live.stop().await.unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_unsupported_requests_get_text_errors() {
        let dispatcher = Arc::new(Dispatcher {
            handler: TestHandler,
            ctx: TestContext::default(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        });
        let app = router(dispatcher.clone());

        for req in [
            HttpRequest::get("/").body(axum::body::Body::empty()).unwrap(),
            HttpRequest::post("/other")
                .body(axum::body::Body::empty())
                .unwrap(),
        ] {
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert_eq!(
                resp.headers()[header::CONTENT_TYPE],
                "text/plain; charset=utf-8"
            );
            let body = resp.into_body().collect().await.unwrap().to_bytes();
            assert!(body.starts_with(b"unsupported request"));
        }
        assert_eq!(dispatcher.ctx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_creates_missing_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("a").join("b").join("cni-server.sock");
        let mut server = Server::new(&socket_path);
        server.start(TestHandler, TestContext::default()).await.unwrap();
        assert!(socket_path.exists());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_in_flight_requests() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("cni-server.sock");
        let mut server = Server::new(&socket_path);
        server.start(SlowHandler, ()).await.unwrap();

        let args = cni_args("ns", "pod");
        let body = request(
            &[
                (CNI_COMMAND, "DEL"),
                (CNI_CONTAINERID, SANDBOX_ID),
                (CNI_ARGS, args.as_str()),
            ],
            CNI_CONFIG,
        );
        let path = socket_path.clone();
        let in_flight = tokio::spawn(async move { post_unix(&path, body).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        server.stop().await.unwrap();
        let (status, body) = in_flight.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"done");

        // no longer accepting
        assert!(UnixStream::connect(&socket_path).await.is_err());
        // and cannot be restarted
        assert!(server.start(SlowHandler, ()).await.is_err());
    }
}
