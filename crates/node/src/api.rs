//! Thin JSON endpoint for rate queries.
//!
//! The full custom-metrics API façade lives outside this process; this
//! listener is what the steering endpoint points consumers at. It answers
//! point queries (`/rates/{tenant}/{pod}`) and selector queries
//! (`/rates/{tenant}?selector=...`).

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use ratewatch_provider::{LabelSelector, PodMetricsProvider};

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Minimal `%XX` / `+` decoding for the selector query parameter.
fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn selector_from_query(query: Option<&str>) -> Result<LabelSelector, ()> {
    let Some(query) = query else {
        return Ok(LabelSelector::everything());
    };
    for param in query.split('&') {
        if let Some((key, value)) = param.split_once('=') {
            if key == "selector" {
                return LabelSelector::parse(&percent_decode(value)).map_err(|_| ());
            }
        }
    }
    Ok(LabelSelector::everything())
}

fn handle(provider: &PodMetricsProvider, req: &Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    if path == "/healthz" {
        return plain(StatusCode::OK, "OK");
    }

    let Some(rest) = path.strip_prefix("/rates/") else {
        return plain(StatusCode::NOT_FOUND, "Not Found");
    };

    let mut parts = rest.splitn(2, '/');
    let tenant = parts.next().unwrap_or_default();
    if tenant.is_empty() {
        return plain(StatusCode::NOT_FOUND, "Not Found");
    }

    match parts.next() {
        Some(pod) => match provider.get_by_name(tenant, pod) {
            Ok(Some(value)) => match serde_json::to_vec(&value) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => {
                    error!("Failed to encode rate value: {}", e);
                    plain(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                }
            },
            Ok(None) => plain(StatusCode::NOT_FOUND, "no fresh rate for this pod"),
            Err(e) => {
                error!("Rate query failed: {}", e);
                plain(StatusCode::INTERNAL_SERVER_ERROR, "rate query failed")
            }
        },
        None => {
            let Ok(selector) = selector_from_query(req.uri().query()) else {
                return plain(StatusCode::BAD_REQUEST, "invalid label selector");
            };
            let values = provider.get_by_selector(tenant, &selector);
            match serde_json::to_vec(&values) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => {
                    error!("Failed to encode rate values: {}", e);
                    plain(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                }
            }
        }
    }
}

/// Serve rate queries on `addr` until `cancel` fires.
pub async fn serve_rates(
    addr: SocketAddr,
    provider: Arc<PodMetricsProvider>,
    cancel: CancellationToken,
) -> Result<(), anyhow::Error> {
    let listener = TcpListener::bind(addr).await?;
    info!("Rate query endpoint listening on http://{}/rates", addr);

    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };
        let io = TokioIo::new(stream);
        let provider = provider.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = handle(&provider, &req);
                async move { Ok::<_, std::convert::Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving rate query connection: {}", e);
            }
        });
    }
}
