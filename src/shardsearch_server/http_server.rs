use std::convert::Infallible;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use shardsearch::auth::Caller;
use shardsearch::proxy::{Proxy, ProxyRequest, ProxyResponse};
use shardsearch::upstream::HttpBackend;
use tokio::net::TcpListener;

use crate::VERSION;

const JSON: &str = "application/json; charset=utf-8";

pub(crate) fn status(status: StatusCode, error_message: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(error_message)));
    *response.status_mut() = status;
    response
}

fn json_response(status_code: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = status(status_code, body.to_string());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(JSON));
    response
}

/// Caller token from `Authorization: Bearer <token>` or the `apikey` header.
fn caller_of(headers: &HeaderMap) -> Caller {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    let apikey = headers
        .get("apikey")
        .and_then(|value| value.to_str().ok())
        .map(str::trim);

    match bearer.or(apikey) {
        Some(token) if !token.is_empty() => Caller::with_token(token),
        _ => Caller::anonymous(),
    }
}

/// Only the content type is relayed of the upstream headers.
fn into_http(response: ProxyResponse) -> Response<Full<Bytes>> {
    let status_code = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut http_response = status(status_code, String::new());
    *http_response.body_mut() = Full::new(Bytes::from(response.body));
    if let Some(content_type) = response
        .content_type
        .and_then(|content_type| HeaderValue::from_str(&content_type).ok())
    {
        http_response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    http_response
}

pub(crate) async fn http_request_handler(
    proxy: Arc<Proxy<HttpBackend>>,
    req: Request<Incoming>,
    remote_addr: SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().trim_matches('/').to_string();

    match (req.method(), path.as_str()) {
        (&Method::GET, "health") => return Ok(json_response(StatusCode::OK, r#"{"ok":true}"#)),
        (&Method::GET, "version") => return Ok(status(StatusCode::OK, VERSION.to_string())),
        _ => {}
    }

    let caller = caller_of(req.headers());
    let query: Vec<(String, String)> = req
        .uri()
        .query()
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();
    let method = req.method().clone();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(e) => return Ok(status(StatusCode::BAD_REQUEST, e.to_string())),
    };

    tracing::debug!("{} {} /{}", remote_addr, method, path);

    let response = proxy
        .handle(ProxyRequest {
            method,
            path,
            query,
            body,
            caller,
        })
        .await;

    Ok(into_http(response))
}

pub(crate) async fn http_server(proxy: Arc<Proxy<HttpBackend>>, local_ip: &str, local_port: u16) {
    let addr: SocketAddr = match format!("{}:{}", local_ip, local_port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("unable to parse socket address {}:{}: {}", local_ip, local_port, e);
            process::exit(1)
        }
    };

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(
                "Starting the server at {:?} failed: {}. \
                Check if there is another shardsearch server instance running on the same port. \
                Try changing the port.",
                addr,
                e
            );
            process::exit(1)
        }
    };

    tracing::info!(
        "Listening on: {} {} upstream {}",
        local_ip,
        local_port,
        proxy.config().upstream_url
    );

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                continue;
            }
        };

        let proxy = proxy.clone();
        tokio::spawn(async move {
            let service =
                service_fn(move |req| http_request_handler(proxy.clone(), req, remote_addr));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!("connection {} closed: {}", remote_addr, e);
            }
        });
    }
}
