use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{ConnectInfo, DefaultBodyLimit, Query, Request as HttpRequest, State, rejection::BytesRejection},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response as HttpResponse},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;

use crate::config::Transport;
use crate::server::{Method, Server};
use crate::types::{ErrorCode, McpError, Request, Response};

/// Largest request body accepted on any route.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Create an axum router for the server.
pub fn http_router(server: Arc<Server>) -> Router {
    let prefix = server.config().resource_prefix().to_string();

    let mut router = Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/healthz", get(handle_healthz))
        .route(&format!("{prefix}/read"), post(handle_resource_read))
        .route(
            &format!("{prefix}/list"),
            get(handle_resource_list).post(handle_resource_list),
        )
        .route("/tool/invoke", post(handle_tool_invoke))
        .route("/tool/list", get(handle_tool_list).post(handle_tool_list))
        .route("/prompt/list", get(handle_prompt_list).post(handle_prompt_list))
        .route("/prompt/get", post(handle_prompt_get));

    if server.config().transport == Transport::Sse {
        router = router.route("/sse", get(handle_sse));
    }

    let logging = server.request_logging();
    let router = router
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(server);
    if logging {
        router.layer(middleware::from_fn(log_request))
    } else {
        router
    }
}

async fn handle_healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn handle_mcp(
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> HttpResponse {
    serve_rpc(&server, None, &headers, body).await
}

async fn handle_resource_read(
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> HttpResponse {
    serve_rpc(&server, Some(Method::ResourcesRead), &headers, body).await
}

async fn handle_resource_list(
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> HttpResponse {
    serve_rpc(&server, Some(Method::ResourcesList), &headers, body).await
}

async fn handle_tool_invoke(
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> HttpResponse {
    serve_rpc(&server, Some(Method::ToolsCall), &headers, body).await
}

async fn handle_tool_list(
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> HttpResponse {
    serve_rpc(&server, Some(Method::ToolsList), &headers, body).await
}

async fn handle_prompt_list(
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> HttpResponse {
    serve_rpc(&server, Some(Method::PromptsList), &headers, body).await
}

async fn handle_prompt_get(
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> HttpResponse {
    serve_rpc(&server, Some(Method::PromptsGet), &headers, body).await
}

/// Decode, dispatch and deliver one call.
///
/// `fixed` pins the method for route-specific endpoints. Calls naming a
/// live session in SSE mode are answered on that session's stream.
async fn serve_rpc(
    server: &Server,
    fixed: Option<Method>,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> HttpResponse {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            tracing::warn!(status = %rejection.status(), error = %rejection, "rejected request body");
            let resp = Response::error(String::new(), ErrorCode::InvalidRequest, rejection.body_text());
            return (rejection.status(), Json(resp)).into_response();
        }
    };
    let mut req = match fixed {
        Some(method) if body.is_empty() && method.is_listing() => Request::new(method.as_str()),
        _ => {
            if !is_json(headers) {
                let resp = Response::error(
                    String::new(),
                    ErrorCode::InvalidRequest,
                    "Content-Type must be application/json",
                );
                return (StatusCode::UNSUPPORTED_MEDIA_TYPE, Json(resp)).into_response();
            }
            match Request::decode(&body) {
                Ok(req) => req,
                Err(resp) => {
                    tracing::debug!(code = resp.error_object().map(|e| e.code), "rejected undecodable body");
                    return reply(resp);
                }
            }
        }
    };

    if let Some(method) = fixed {
        req.method = method.as_str().to_string();
    }

    if server.config().transport == Transport::Sse {
        if let Some(session) = req.session.clone().filter(|s| !s.is_empty()) {
            return deliver_to_session(server, &session, req).await;
        }
    }

    reply(server.handle(req).await)
}

async fn deliver_to_session(server: &Server, session: &str, req: Request) -> HttpResponse {
    let sessions = server.sessions();
    let Some(initialized) = sessions.is_initialized(session).await else {
        tracing::warn!(session = %session, "request for unknown session");
        let err = McpError::SessionNotFound(session.to_string());
        return reply(Response::from_error(req.response_id(), &err));
    };

    let method = Method::parse(&req.method);
    let gated = server.config().require_initialize
        && !initialized
        && !matches!(method, Some(Method::Initialize | Method::Ping));

    let response = if gated {
        Response::from_error(req.response_id(), &McpError::NotInitialized(session.to_string()))
    } else {
        server.handle(req).await
    };

    if method == Some(Method::Initialize) && !response.is_error() {
        sessions.mark_initialized(session).await;
    }

    match sessions.send(session, &response).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => {
            tracing::warn!(session = %session, error = %err, "could not queue response");
            reply(Response::from_error(response.id, &err))
        }
    }
}

fn reply(resp: Response) -> HttpResponse {
    (StatusCode::OK, Json(resp)).into_response()
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

#[derive(Debug, Deserialize)]
struct SseQuery {
    id: Option<String>,
}

async fn handle_sse(State(server): State<Arc<Server>>, Query(query): Query<SseQuery>) -> HttpResponse {
    let Some(id) = query.id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing client id").into_response();
    };

    match server.sessions().register(&id).await {
        Ok(stream) => stream.into_response(),
        Err(McpError::DuplicateSession(_)) => {
            (StatusCode::CONFLICT, "client already exists").into_response()
        }
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
    }
}

/// Log every inbound request, body included.
pub async fn log_request(req: HttpRequest, next: Next) -> HttpResponse {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(path = %parts.uri.path(), error = %err, "failed to read request body");
            let resp = Response::error(
                String::new(),
                ErrorCode::InvalidRequest,
                format!("request body exceeds {MAX_BODY_BYTES} bytes"),
            );
            return (StatusCode::PAYLOAD_TOO_LARGE, Json(resp)).into_response();
        }
    };

    let header_str = |name: header::HeaderName| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    tracing::info!(
        method = %parts.method,
        path = %parts.uri.path(),
        query = parts.uri.query().unwrap_or_default(),
        remote_addr = %remote_addr,
        user_agent = %header_str(header::USER_AGENT),
        content_type = %header_str(header::CONTENT_TYPE),
        body = %String::from_utf8_lossy(&bytes),
        "incoming request"
    );

    next.run(HttpRequest::from_parts(parts, Body::from(bytes))).await
}

/// Bind `addr` and serve until ctrl-c.
pub async fn serve(server: Arc<Server>, addr: &str) -> Result<(), McpError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| McpError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    serve_listener(server, listener, shutdown_signal()).await
}

/// Serve on an already-bound listener until `shutdown` resolves.
///
/// Shutdown closes every SSE session so their connections can drain.
pub async fn serve_listener<F>(server: Arc<Server>, listener: TcpListener, shutdown: F) -> Result<(), McpError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local = listener.local_addr()?;
    tracing::info!(
        addr = %local,
        name = %server.config().name,
        transport = %server.config().transport,
        "server listening"
    );

    let sessions = server.sessions().clone();
    let app = http_router(server);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("shutting down");
            sessions.shutdown();
        })
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, ServerConfig};
    use crate::resource::{FnResource, ResourceContext, ResourceType};
    use crate::tool::FnTool;
    use http_body_util::BodyExt;
    use serde_json::{Map, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_server(config: ServerConfig) -> Arc<Server> {
        let server = Server::builder()
            .config(config)
            .tool(FnTool::new("echo", "echoes", vec![], |args: Map<String, Value>| async move {
                Ok(Value::Object(args))
            }))
            .resource(
                "/items/{id}",
                FnResource::new("item", "one item", ResourceType::Json, |ctx: ResourceContext| async move {
                    Ok(json!({ "id": ctx.param("id") }))
                }),
            )
            .build()
            .unwrap();
        Arc::new(server)
    }

    fn sse_config() -> ServerConfig {
        ServerConfig {
            mode: Mode::Test,
            ..ServerConfig::new("test")
        }
    }

    fn test_router() -> Router {
        http_router(test_server(sse_config()))
    }

    fn json_body(body: Value) -> Body {
        Body::from(serde_json::to_vec(&body).unwrap())
    }

    fn post_json(uri: &str, body: Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(json_body(body))
            .unwrap()
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn read_envelope(resp: HttpResponse) -> Response {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Next `data:` payload from an SSE body, decoded as an envelope.
    async fn next_event(body: &mut Body) -> Response {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
                .await
                .expect("timed out waiting for event")
                .expect("stream ended")
                .expect("body error");
            if let Ok(data) = frame.into_data() {
                let text = String::from_utf8(data.to_vec()).unwrap();
                if let Some(payload) = text.strip_prefix("data: ") {
                    return serde_json::from_str(payload.trim_end()).unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn test_health_check() {
        let resp = test_router().oneshot(get("/healthz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_tool_invoke_bad_body() {
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/tool/invoke")
            .header("content-type", "application/json")
            .body(Body::from("{bad json"))
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let env = read_envelope(resp).await;
        assert_eq!(env.id, "");
        assert_eq!(env.error_object().unwrap().code, -32700);
    }

    #[tokio::test]
    async fn test_non_json_content_type() {
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/tool/invoke")
            .header("content-type", "text/plain")
            .body(Body::from("{}"))
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(read_envelope(resp).await.error_object().unwrap().code, -32600);
    }

    #[tokio::test]
    async fn test_tool_invoke_ignores_envelope_method() {
        let body = json!({"id": 5, "method": "ping", "params": {"tool_name": "echo", "arguments": {"x": 1}}});
        let resp = test_router().oneshot(post_json("/tool/invoke", body)).await.unwrap();
        let env = read_envelope(resp).await;
        assert_eq!(env.id, "5");
        assert_eq!(env.result(), Some(&json!({"x": 1})));
    }

    #[tokio::test]
    async fn test_resource_read_route() {
        let body = json!({"id": "r", "params": {"uri": "/items/42"}});
        let resp = test_router().oneshot(post_json("/resource/read", body)).await.unwrap();
        assert_eq!(read_envelope(resp).await.result(), Some(&json!({"id": "42"})));
    }

    #[tokio::test]
    async fn test_list_routes_accept_get_without_body() {
        let resp = test_router().oneshot(get("/tool/list")).await.unwrap();
        let env = read_envelope(resp).await;
        assert_eq!(env.result().unwrap()["tools"][0]["name"], "echo");

        let resp = test_router().oneshot(get("/resource/list")).await.unwrap();
        let env = read_envelope(resp).await;
        assert_eq!(env.result().unwrap()["resources"][0]["name"], "item");
    }

    #[tokio::test]
    async fn test_custom_resource_prefix() {
        let config = ServerConfig {
            resource_prefix: "/res/".into(),
            ..sse_config()
        };
        let app = http_router(test_server(config));
        let resp = app.clone().oneshot(get("/res/list")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app.oneshot(get("/resource/list")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_mcp_requires_method() {
        let resp = test_router()
            .oneshot(post_json("/mcp", json!({"id": "1"})))
            .await
            .unwrap();
        assert_eq!(read_envelope(resp).await.error_object().unwrap().code, -32600);

        let resp = test_router()
            .oneshot(post_json("/mcp", json!({"id": "2", "method": "nope"})))
            .await
            .unwrap();
        assert_eq!(read_envelope(resp).await.error_object().unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let resp = test_router().oneshot(get("/mcp")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_sse_requires_id() {
        let resp = test_router().oneshot(get("/sse")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = test_router().oneshot(get("/sse?id=")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sse_duplicate_id_conflicts() {
        let app = test_router();
        let first = app.clone().oneshot(get("/sse?id=dup")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()[header::CONTENT_TYPE], "text/event-stream");

        let second = app.oneshot(get("/sse?id=dup")).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_session_response_goes_to_stream() {
        let app = test_router();
        let stream = app.clone().oneshot(get("/sse?id=s1")).await.unwrap();
        let mut events = stream.into_body();

        for i in 0..3 {
            let body = json!({
                "id": format!("{i}"),
                "session": "s1",
                "params": {"tool_name": "echo", "arguments": {"n": i}}
            });
            let resp = app.clone().oneshot(post_json("/tool/invoke", body)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::ACCEPTED);
            assert!(resp.into_body().collect().await.unwrap().to_bytes().is_empty());
        }

        for i in 0..3 {
            let env = next_event(&mut events).await;
            assert_eq!(env.id, format!("{i}"));
            assert_eq!(env.result(), Some(&json!({"n": i})));
        }
    }

    #[tokio::test]
    async fn test_unknown_session_answered_directly() {
        let body = json!({"id": "x", "session": "ghost", "method": "ping"});
        let resp = test_router().oneshot(post_json("/mcp", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let env = read_envelope(resp).await;
        assert_eq!(env.id, "x");
        assert_eq!(env.error_object().unwrap().code, -32600);
    }

    #[tokio::test]
    async fn test_require_initialize_gates_session() {
        let config = ServerConfig {
            require_initialize: true,
            ..sse_config()
        };
        let server = test_server(config);
        let app = http_router(Arc::clone(&server));
        let mut events = app.clone().oneshot(get("/sse?id=s")).await.unwrap().into_body();

        let list = json!({"id": "1", "session": "s", "method": "tools/list"});
        app.clone().oneshot(post_json("/mcp", list.clone())).await.unwrap();
        assert_eq!(next_event(&mut events).await.error_object().unwrap().code, -32001);

        let init = json!({"id": "2", "session": "s", "method": "initialize"});
        app.clone().oneshot(post_json("/mcp", init)).await.unwrap();
        assert!(next_event(&mut events).await.result().is_some());
        assert_eq!(server.sessions().is_initialized("s").await, Some(true));

        app.oneshot(post_json("/mcp", list)).await.unwrap();
        let env = next_event(&mut events).await;
        assert_eq!(env.id, "1");
        assert!(env.result().unwrap()["tools"].is_array());
    }

    #[tokio::test]
    async fn test_streamable_http_answers_directly() {
        let config = ServerConfig {
            transport: Transport::StreamableHttp,
            ..sse_config()
        };
        let app = http_router(test_server(config));

        let resp = app.clone().oneshot(get("/sse?id=a")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let body = json!({"id": "1", "session": "a", "method": "ping"});
        let resp = app.oneshot(post_json("/mcp", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(read_envelope(resp).await.result(), Some(&json!({})));
    }

    #[tokio::test]
    async fn test_request_logging_preserves_body() {
        let server = Server::builder()
            .mode(Mode::Debug)
            .tool(FnTool::new("echo", "echoes", vec![], |args: Map<String, Value>| async move {
                Ok(Value::Object(args))
            }))
            .build()
            .unwrap();
        assert!(server.request_logging());
        let app = http_router(Arc::new(server));

        let body = json!({"id": "1", "params": {"tool_name": "echo", "arguments": {"kept": true}}});
        let resp = app.oneshot(post_json("/tool/invoke", body)).await.unwrap();
        assert_eq!(read_envelope(resp).await.result(), Some(&json!({"kept": true})));
    }

    fn oversized_body() -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/tool/invoke")
            .header("content-type", "application/json")
            .body(Body::from(vec![b' '; MAX_BODY_BYTES + 1]))
            .unwrap()
    }

    #[tokio::test]
    async fn test_oversized_body_gets_envelope_with_logging() {
        let server = Server::builder().mode(Mode::Debug).build().unwrap();
        let resp = http_router(Arc::new(server)).oneshot(oversized_body()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let env = read_envelope(resp).await;
        assert_eq!(env.id, "");
        assert_eq!(env.error_object().unwrap().code, -32600);
    }

    #[tokio::test]
    async fn test_oversized_body_gets_envelope_without_logging() {
        let resp = test_router().oneshot(oversized_body()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(read_envelope(resp).await.error_object().unwrap().code, -32600);
    }

    #[tokio::test]
    async fn test_end_to_end_over_tcp() {
        let server = test_server(sse_config());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(serve_listener(Arc::clone(&server), listener, async move {
            let _ = stop_rx.await;
        }));

        let client = reqwest::Client::new();
        let base = format!("http://{addr}");

        let health: Value = client
            .get(format!("{base}/healthz"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health, json!({"status": "ok"}));

        let mut stream = client.get(format!("{base}/sse?id=e2e")).send().await.unwrap();
        assert_eq!(stream.status(), reqwest::StatusCode::OK);
        assert!(server.sessions().contains("e2e").await);

        let accepted = client
            .post(format!("{base}/tool/invoke"))
            .json(&json!({"id": "9", "session": "e2e", "params": {"tool_name": "echo", "arguments": {"v": "hi"}}}))
            .send()
            .await
            .unwrap();
        assert_eq!(accepted.status(), reqwest::StatusCode::ACCEPTED);

        let mut buf = String::new();
        while !buf.ends_with("\n\n") {
            let chunk = tokio::time::timeout(Duration::from_secs(2), stream.chunk())
                .await
                .unwrap()
                .unwrap()
                .expect("stream closed early");
            buf.push_str(std::str::from_utf8(&chunk).unwrap());
        }
        let payload = buf.trim().strip_prefix("data: ").unwrap();
        let env: Response = serde_json::from_str(payload).unwrap();
        assert_eq!(env.id, "9");
        assert_eq!(env.result(), Some(&json!({"v": "hi"})));

        let direct: Response = client
            .post(format!("{base}/mcp"))
            .json(&json!({"id": 3, "method": "ping"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(direct.id, "3");

        stop_tx.send(()).unwrap();
        drop(stream);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        for _ in 0..100 {
            if server.sessions().is_empty().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session e2e survived shutdown");
    }
}
