//! Client-facing request handler
//!
//! One fallback handler passes every S3 verb through: enforce the body
//! size limit, resolve the region from the Host header, verify the
//! client signature, then hand the buffered request to the region's
//! consistency gate. A client that hangs up mid-request cancels the
//! pending replica round-trips with this future; the gate's completion
//! bookkeeping detaches itself and still runs.

use crate::metrics::ProxyMetrics;
use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, StatusCode};
use repligate_common::Error;
use repligate_sharding::{Authenticator, RegionRouter};
use repligate_storages::{ProxyRequest, RequestContext, ResponseBody};
use std::sync::Arc;

/// Shared state of the client listener
pub struct AppState {
    pub router: Arc<RegionRouter>,
    pub authenticator: Arc<Authenticator>,
    pub body_max_size: u64,
    pub metrics: Arc<ProxyMetrics>,
}

/// The pass-through handler for every route
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let method = parts.method;
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(|q| q.to_string());
    let headers = parts.headers;

    // Content-Length is checked before the body is pulled in
    match declared_length(&headers) {
        Ok(Some(length)) if length > state.body_max_size => {
            state.metrics.record_rejected_too_large();
            return error_response(
                &Error::EntityTooLarge { max_size: state.body_max_size },
                "",
            );
        }
        Ok(_) => {}
        Err(error) => return error_response(&error, ""),
    }

    let Some(host) = headers.get(http::header::HOST).and_then(|v| v.to_str().ok()) else {
        return error_response(&Error::invalid_request("missing host header"), "");
    };
    let Some(gate) = state.router.ring_for_host(host) else {
        return error_response(&Error::RegionNotFound(host.to_string()), "");
    };
    let domain = host.split(':').next().unwrap_or(host).to_string();

    let access_key = match state
        .authenticator
        .authenticate(&method, &path, query.as_deref(), &headers)
        .await
    {
        Ok(access_key) => access_key,
        Err(error) => {
            state.metrics.record_error();
            return error_response(&error, "");
        }
    };

    let body = match axum::body::to_bytes(body, state.body_max_size as usize).await {
        Ok(body) => body,
        Err(_) => {
            state.metrics.record_rejected_too_large();
            return error_response(
                &Error::EntityTooLarge { max_size: state.body_max_size },
                "",
            );
        }
    };
    state.metrics.record_request(body.len() as u64);

    let props = gate.props();
    let context = Arc::new(RequestContext::new(
        domain,
        access_key,
        props.consistency_level,
        props.read_repair,
    ));
    let request_id = context.request_id.clone();
    let mut proxy_request =
        ProxyRequest::new(method, path, query, headers, body, Arc::clone(&context));

    // A client disconnect drops this future, cancelling the in-flight
    // replica round-trips; the gate detaches its completion bookkeeping
    // in that case, so the consistency log stays correct either way.
    match gate.handle(&mut proxy_request).await {
        Ok(response) => {
            state.metrics.record_response(response.status.as_u16());
            backend_to_client(response)
        }
        Err(error) => {
            state.metrics.record_error();
            error_response(&error, &request_id)
        }
    }
}

/// Parse Content-Length, if present
fn declared_length(headers: &HeaderMap) -> Result<Option<u64>, Error> {
    let Some(value) = headers.get(http::header::CONTENT_LENGTH) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| Error::invalid_request("unparsable content-length"))
}

/// Convert a backend response for the client, streaming when possible
fn backend_to_client(response: repligate_storages::BackendResponse) -> Response {
    let mut builder = Response::builder().status(response.status);
    for (name, value) in response.headers.iter() {
        // Hop-by-hop headers do not survive the proxy
        if name == http::header::CONNECTION || name == http::header::TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }

    let body = match response.body {
        ResponseBody::Streamed(upstream) => Body::from_stream(upstream.bytes_stream()),
        ResponseBody::Buffered(bytes) => Body::from(bytes),
        ResponseBody::Empty => Body::empty(),
    };
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// S3-style XML error response
pub fn error_response(error: &Error, request_id: &str) -> Response {
    let status = StatusCode::from_u16(error.http_status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Error>
    <Code>{}</Code>
    <Message>{}</Message>
    <RequestId>{}</RequestId>
</Error>"#,
        error.s3_error_code(),
        error,
        if request_id.is_empty() { "unknown" } else { request_id },
    );

    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/xml")
        .body(Body::from(xml))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_length() {
        let mut headers = HeaderMap::new();
        assert_eq!(declared_length(&headers).unwrap(), None);

        headers.insert(http::header::CONTENT_LENGTH, "1024".parse().unwrap());
        assert_eq!(declared_length(&headers).unwrap(), Some(1024));

        headers.insert(http::header::CONTENT_LENGTH, "not-a-number".parse().unwrap());
        assert!(declared_length(&headers).is_err());
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(&Error::AccessDenied, "req-1");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers()[http::header::CONTENT_TYPE],
            "application/xml"
        );

        let response =
            error_response(&Error::EntityTooLarge { max_size: 10 }, "");
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
