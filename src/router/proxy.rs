//! Reverse proxy in front of running workspaces.

use std::sync::Arc;

use anyhow::Context;
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::model::ProxyConfig;

use super::FingerprintRouter;

/// Query parameter carrying the auth token; never forwarded upstream.
pub const AUTH_TOKEN_PARAM: &str = "auth_token";

/// Largest request body buffered for forwarding.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const HOP_BY_HOP: [HeaderName; 4] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TE,
];

#[derive(Clone)]
pub struct ProxyState {
    pub router: Arc<FingerprintRouter>,
    pub client: reqwest::Client,
    pub worker_host: String,
}

impl ProxyState {
    pub fn new(router: Arc<FingerprintRouter>, worker_host: String) -> Self {
        Self {
            router,
            client: reqwest::Client::new(),
            worker_host,
        }
    }
}

pub fn proxy_router(state: ProxyState) -> Router {
    Router::new().fallback(proxy_handler).with_state(state)
}

/// Upstream URL for `path_and_query` with the auth token parameter removed.
/// Every other parameter, `folder` included, is kept in order.
pub fn target_url(worker_host: &str, port: u16, path_and_query: &str) -> Option<Url> {
    let mut url = Url::parse(&format!("http://{}:{}{}", worker_host, port, path_and_query)).ok()?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != AUTH_TOKEN_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    Some(url)
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    out.remove(header::HOST);
    for name in HOP_BY_HOP {
        out.remove(name);
    }
    out
}

async fn proxy_handler(State(state): State<ProxyState>, req: Request) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let port = match state.router.resolve(&host).await {
        Ok(port) => port,
        Err(e) => {
            warn!(host = %host, "proxy route failed: {}", e);
            return e.into_response();
        }
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let Some(target) = target_url(&state.worker_host, port, &path_and_query) else {
        return (StatusCode::BAD_REQUEST, "invalid request path").into_response();
    };

    let (parts, body) = req.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response(),
    };

    let upstream = state
        .client
        .request(parts.method, target.clone())
        .headers(forwardable(&parts.headers))
        .header(header::HOST, format!("{}:{}", state.worker_host, port))
        .body(body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(resp) => resp,
        Err(e) => {
            warn!(target = %target, "upstream request failed: {}", e);
            return (StatusCode::BAD_GATEWAY, format!("upstream unavailable: {}", e)).into_response();
        }
    };

    let status = upstream.status();
    let headers = forwardable(upstream.headers());
    match upstream.bytes().await {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        Err(e) => (StatusCode::BAD_GATEWAY, format!("upstream body failed: {}", e)).into_response(),
    }
}

/// Serve the proxy on `0.0.0.0:<config.port>` until cancelled.
pub async fn serve_proxy(
    config: &ProxyConfig,
    router: Arc<FingerprintRouter>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = proxy_router(ProxyState::new(router, config.worker_host.clone()));
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding proxy on {}", addr))?;
    info!("proxy listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_token_stripped_and_folder_kept() {
        let url = target_url(
            "127.0.0.1",
            20001,
            "/?folder=/workspaces/42&auth_token=abc.def&tkn=x",
        )
        .unwrap();
        assert_eq!(url.host_str(), Some("127.0.0.1"));
        assert_eq!(url.port(), Some(20001));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("folder".to_string(), "/workspaces/42".to_string()),
                ("tkn".to_string(), "x".to_string()),
            ]
        );
    }

    #[test]
    fn token_only_query_is_dropped() {
        let url = target_url("127.0.0.1", 20001, "/static/app.js?auth_token=abc").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:20001/static/app.js");
    }

    #[test]
    fn hop_by_hop_headers_not_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "fp.example.com".parse().unwrap());
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(header::ACCEPT, "text/html".parse().unwrap());

        let out = forwardable(&headers);
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert_eq!(out.get(header::ACCEPT).unwrap(), "text/html");
    }
}
