use crate::metrics::{MetricsStore, ProxyStats};
use anyhow::Result;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
struct Sources {
    stats: Arc<ProxyStats>,
    store: Arc<MetricsStore>,
}

/// Start the HTTP metrics server on the specified port.
pub async fn serve_metrics(
    stats: Arc<ProxyStats>,
    store: Arc<MetricsStore>,
    port: u16,
) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let sources = Sources { stats, store };

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let sources = sources.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let sources = sources.clone();
                async move { Ok::<_, Infallible>(route(req.uri().path(), &sources)) }
            });

            let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);

            if let Err(e) = conn.await {
                error!("Connection error: {}", e);
            }
        });
    }
}

fn route(path: &str, sources: &Sources) -> Response<String> {
    match path {
        "/metrics" => {
            let mut body = sources.stats.to_prometheus();
            body.push_str(&sources.store.to_prometheus());
            response(StatusCode::OK, "text/plain; version=0.0.4", body)
        }
        "/metrics.json" => match sources.store.to_json() {
            Ok(body) => response(StatusCode::OK, "application/json", body),
            Err(e) => response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                e.to_string(),
            ),
        },
        "/health" => response(StatusCode::OK, "text/plain", "OK".to_string()),
        _ => response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    }
}

fn response(status: StatusCode, content_type: &'static str, body: String) -> Response<String> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}
