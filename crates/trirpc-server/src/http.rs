//! HTTP transport: direct per-method endpoints, the JSON-RPC root endpoint,
//! the endpoint listing page, and the layers every response goes through.

use std::any::Any;
use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{DefaultBodyLimit, FromRequestParts, Query, Request, State};
use axum::http::header::{CONTENT_TYPE, HOST};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, get};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;
use trirpc_core::{
    Dispatcher, MethodRegistry, Request as RpcRequest, Response as RpcResponse, RpcError,
    Transport,
};

use crate::config::WsConfig;
use crate::errors::ServerError;
use crate::listener::PeerAddr;
use crate::websocket::ws_handler;

/// Response header carrying the server clock in Unix seconds.
pub const X_SERVER_TIME: &str = "x-server-time";

/// State shared by every route.
#[derive(Clone)]
pub struct AppState {
    /// Method dispatch.
    pub dispatcher: Arc<Dispatcher>,
    /// Websocket session tuning.
    pub ws: Arc<WsConfig>,
    /// Root shutdown token; sessions take children of it.
    pub shutdown: CancellationToken,
    /// Prometheus handle when `/metrics` is served.
    pub metrics: Option<PrometheusHandle>,
}

/// Peer address from the listener, when the router is served with
/// connect info.
#[derive(Debug, Clone)]
pub struct RemoteAddr(pub Option<String>);

impl<S: Send + Sync> FromRequestParts<S> for RemoteAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<ConnectInfo<PeerAddr>>()
                .map(|ConnectInfo(addr)| addr.to_string()),
        ))
    }
}

/// Build the full router.
///
/// Fails when the websocket settings are unusable, or when a method name
/// collides with the websocket endpoint or `/metrics`.
pub fn build_router(state: AppState, max_body_bytes: usize) -> Result<Router, ServerError> {
    state.ws.validate()?;
    let mut taken = HashSet::from(["/".to_owned()]);
    let mut claim = |path: &str| {
        if taken.insert(path.to_owned()) {
            Ok(())
        } else {
            Err(ServerError::RouteConflict {
                path: path.to_owned(),
            })
        }
    };

    let mut router: Router<AppState> = Router::new();

    claim(&state.ws.endpoint)?;
    router = router.route(&state.ws.endpoint, get(ws_handler));

    if state.metrics.is_some() {
        claim("/metrics")?;
        router = router.route("/metrics", get(metrics_handler));
    }

    for binding in state.dispatcher.registry().iter() {
        let path = format!("/{}", binding.name());
        claim(&path)?;
        let method = binding.name().to_owned();
        let direct = move |State(state): State<AppState>,
                           Query(pairs): Query<Vec<(String, String)>>| {
            let method = method.clone();
            async move {
                let response = state.dispatcher.handle_query(&method, &pairs).await;
                rpc_json(StatusCode::OK, &response)
            }
        };
        router = router.route(&path, get(direct.clone()).post(direct));
    }

    Ok(router
        .route("/", any(jsonrpc_handler))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn(server_time))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// `POST /` JSON-RPC. An empty body gets the endpoint listing.
async fn jsonrpc_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if body.is_empty() {
        let host = headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default();
        return Html(endpoint_listing(host, state.dispatcher.registry())).into_response();
    }

    let value: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            let err = RpcError::Parse {
                detail: format!("error unmarshalling request: {e}"),
            };
            return rpc_json(StatusCode::OK, &RpcResponse::failure(new_id(), &err));
        }
    };

    let request: RpcRequest = match serde_json::from_value(value.clone()) {
        Ok(r) => r,
        Err(e) => {
            let id = value
                .get("id")
                .and_then(Value::as_str)
                .map_or_else(new_id, str::to_owned);
            let err = RpcError::InvalidRequest {
                detail: e.to_string(),
            };
            return rpc_json(StatusCode::OK, &RpcResponse::failure(id, &err));
        }
    };

    match state
        .dispatcher
        .handle_request(request, Transport::Http, None)
        .await
    {
        Some(response) => rpc_json(StatusCode::OK, &response),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "404 page not found\n")
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Pretty-printed JSON response envelope.
fn rpc_json(status: StatusCode, response: &RpcResponse) -> Response {
    match serde_json::to_vec_pretty(response) {
        Ok(body) => (status, [(CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// HTML page linking every method, argument-less ones first.
pub fn endpoint_listing(host: &str, registry: &MethodRegistry) -> String {
    let host = escape_html(host);
    let (no_args, with_args): (Vec<_>, Vec<_>) =
        registry.iter().partition(|b| b.params().is_empty());

    let mut page = String::from("<html><body><br>Available endpoints:<br>");
    for binding in no_args {
        let link = format!("//{host}/{}", binding.name());
        let _ = write!(page, "<a href=\"{link}\">{link}</a></br>");
    }
    page.push_str("<br>Endpoints that require arguments:<br>");
    for binding in with_args {
        let query = binding
            .arg_names()
            .map(|name| format!("{name}=_"))
            .collect::<Vec<_>>()
            .join("&");
        let link = format!("//{host}/{}?{query}", binding.name());
        let _ = write!(page, "<a href=\"{link}\">{link}</a></br>");
    }
    page.push_str("</body></html>");
    page
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

async fn server_time(request: Request, next: Next) -> Response {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let mut response = next.run(request).await;
    let _ = response
        .headers_mut()
        .insert(HeaderName::from_static(X_SERVER_TIME), HeaderValue::from(now));
    response
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .expose_headers([HeaderName::from_static(X_SERVER_TIME)])
}

/// A panic that escaped the dispatcher: 500 with an internal-error envelope.
fn panic_response(panic: Box<dyn Any + Send + 'static>) -> axum::http::Response<Body> {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_owned();
    error!(panic = %detail, "panic in HTTP handler");
    rpc_json(
        StatusCode::INTERNAL_SERVER_ERROR,
        &RpcResponse::failure("", &RpcError::Internal { detail }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::Request as HttpRequest;
    use serde::Deserialize;
    use serde_json::json;
    use tower::ServiceExt;
    use trirpc_core::{Codec, ConnectionContext};

    #[derive(Debug, serde::Serialize, Deserialize)]
    struct EchoResult {
        value: String,
    }

    fn registry() -> MethodRegistry {
        let mut reg = MethodRegistry::new();
        reg.register(
            "echo",
            |arg: String| async move { Ok::<_, String>(EchoResult { value: arg }) },
            &["arg"],
        )
        .unwrap();
        reg.register(
            "add",
            |a: i64, b: i64| async move { Ok::<_, String>(a + b) },
            &["a", "b"],
        )
        .unwrap();
        reg.register("status", || async { Ok::<_, String>("ok") }, &[])
            .unwrap();
        reg.register(
            "explode",
            || async {
                if true {
                    panic!("boom");
                }
                Ok::<_, String>(())
            },
            &[],
        )
        .unwrap();
        reg.register_ws(
            "whoami",
            |ctx: ConnectionContext| async move { Ok::<_, String>(ctx.connection_id().to_owned()) },
            &[],
        )
        .unwrap();
        reg
    }

    fn state_with(registry: MethodRegistry, metrics: Option<PrometheusHandle>) -> AppState {
        AppState {
            dispatcher: Arc::new(Dispatcher::new(Arc::new(registry), Arc::new(Codec::new()))),
            ws: Arc::new(WsConfig::default()),
            shutdown: CancellationToken::new(),
            metrics,
        }
    }

    fn router() -> Router {
        build_router(state_with(registry(), None), 1024).unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_root(body: &str) -> Request {
        HttpRequest::builder()
            .method("POST")
            .uri("/")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    fn get(uri: &str) -> Request {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn direct_get_decodes_query() {
        let resp = router().oneshot(get("/echo?arg=acbd")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["result"], json!({"value": "acbd"}));
        assert!(body.get("id").is_none());
    }

    #[tokio::test]
    async fn direct_quoted_and_hex_string() {
        let resp = router()
            .oneshot(get("/echo?arg=%22acbd%22"))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["result"]["value"], "acbd");

        let resp = router().oneshot(get("/echo?arg=0x616263")).await.unwrap();
        assert_eq!(body_json(resp).await["result"]["value"], "abc");
    }

    #[tokio::test]
    async fn direct_post_uses_query_too() {
        let req = HttpRequest::builder()
            .method("POST")
            .uri("/add?a=2&b=40")
            .body(Body::empty())
            .unwrap();
        let body = body_json(router().oneshot(req).await.unwrap()).await;
        assert_eq!(body["result"], 42);
    }

    #[tokio::test]
    async fn direct_missing_args_take_zero_values() {
        let body = body_json(router().oneshot(get("/add?a=5")).await.unwrap()).await;
        assert_eq!(body["result"], 5);
    }

    #[tokio::test]
    async fn direct_bad_integer_is_invalid_params() {
        let body = body_json(router().oneshot(get("/add?a=x&b=1")).await.unwrap()).await;
        assert_eq!(body["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn connection_bound_method_not_on_http() {
        let body = body_json(router().oneshot(get("/whoami")).await.unwrap()).await;
        assert_eq!(body["error"]["code"], -32601);

        let resp = router()
            .oneshot(post_root(r#"{"id":"1","method":"whoami"}"#))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn jsonrpc_named_params() {
        let resp = router()
            .oneshot(post_root(
                r#"{"jsonrpc":"2.0","id":"1","method":"echo","params":{"arg":"acbd"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(
            body,
            json!({"jsonrpc": "2.0", "id": "1", "result": {"value": "acbd"}})
        );
    }

    #[tokio::test]
    async fn jsonrpc_positional_count_mismatch() {
        let resp = router()
            .oneshot(post_root(r#"{"id":"2","method":"add","params":[1]}"#))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], -32602);
        let detail = body["error"]["data"].as_str().unwrap();
        assert!(detail.contains("expected 2"), "{detail}");
        assert!(detail.contains("got 1"), "{detail}");
    }

    #[tokio::test]
    async fn jsonrpc_parse_error_gets_generated_id() {
        let resp = router().oneshot(post_root("{oops")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], -32700);
        assert!(!body["id"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn jsonrpc_missing_method_is_invalid_request() {
        let resp = router().oneshot(post_root(r#"{"id":"5"}"#)).await.unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["id"], "5");
        assert_eq!(body["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn jsonrpc_unknown_method() {
        let resp = router()
            .oneshot(post_root(r#"{"id":"3","method":"nope"}"#))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], -32601);
        assert_eq!(body["error"]["message"], "Method not found");
    }

    #[tokio::test]
    async fn notification_has_no_body() {
        let resp = router()
            .oneshot(post_root(r#"{"method":"echo","params":{"arg":"x"}}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn empty_body_lists_endpoints() {
        let req = HttpRequest::builder()
            .uri("/")
            .header(HOST, "node:26657")
            .body(Body::empty())
            .unwrap();
        let resp = router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let page = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(page.contains(r#"<a href="//node:26657/status">//node:26657/status</a>"#));
        assert!(page.contains("//node:26657/add?a=_&b=_"));
        let no_args = page.find("/status").unwrap();
        let with_args = page.find("require arguments").unwrap();
        assert!(no_args < with_args);
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let resp = router().oneshot(get("/no/such/path")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn oversized_body_is_413() {
        let big = format!(
            r#"{{"id":"1","method":"echo","params":{{"arg":"{}"}}}}"#,
            "x".repeat(4096)
        );
        let resp = router().oneshot(post_root(&big)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn panicking_method_is_internal_error_with_200() {
        let body = body_json(router().oneshot(get("/explode")).await.unwrap()).await;
        assert_eq!(body["error"]["code"], -32603);
        assert!(body["error"]["data"].as_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn cors_and_server_time_headers() {
        let req = HttpRequest::builder()
            .uri("/status")
            .header("origin", "https://app.example")
            .body(Body::empty())
            .unwrap();
        let resp = router().oneshot(req).await.unwrap();
        let headers = resp.headers();
        assert_eq!(
            headers["access-control-allow-origin"],
            "https://app.example"
        );
        assert_eq!(headers["access-control-allow-credentials"], "true");
        assert!(
            headers["access-control-expose-headers"]
                .to_str()
                .unwrap()
                .to_ascii_lowercase()
                .contains("x-server-time")
        );
        let secs: u64 = headers[X_SERVER_TIME].to_str().unwrap().parse().unwrap();
        assert!(secs > 1_600_000_000);
    }

    #[tokio::test]
    async fn outer_panic_becomes_500() {
        let resp = panic_response(Box::new("layer exploded"));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], -32603);
        assert_eq!(body["error"]["data"], "layer exploded");
    }

    #[test]
    fn method_colliding_with_ws_endpoint_is_rejected() {
        let mut reg = MethodRegistry::new();
        reg.register("websocket", || async { Ok::<_, String>(()) }, &[])
            .unwrap();
        let err = build_router(state_with(reg, None), 1024).unwrap_err();
        assert!(matches!(err, ServerError::RouteConflict { path } if path == "/websocket"));
    }

    #[test]
    fn unusable_ws_config_is_an_error() {
        let relative = AppState {
            ws: Arc::new(WsConfig {
                endpoint: "ws".into(),
                ..WsConfig::default()
            }),
            ..state_with(registry(), None)
        };
        let err = build_router(relative, 1024).unwrap_err();
        assert!(matches!(err, ServerError::InvalidConfig(msg) if msg.contains("endpoint")));

        let no_ping = AppState {
            ws: Arc::new(WsConfig {
                ping_period: std::time::Duration::ZERO,
                ..WsConfig::default()
            }),
            ..state_with(registry(), None)
        };
        assert!(matches!(
            build_router(no_ping, 1024),
            Err(ServerError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn metrics_route_only_when_enabled() {
        let resp = router().oneshot(get("/metrics")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        let router = build_router(state_with(registry(), Some(handle)), 1024).unwrap();
        let resp = router.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn listing_escapes_host() {
        let page = endpoint_listing("<evil>", &MethodRegistry::new());
        assert!(page.contains("Available endpoints"));
        assert!(!page.contains("<evil>"));
    }
}
