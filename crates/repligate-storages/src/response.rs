//! Backend responses and fan-out aggregation

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use repligate_common::{Error, Result};

/// Response body: streamed straight from the backend, or buffered after
/// inspection (multipart complete parses the XML before forwarding).
#[derive(Debug)]
pub enum ResponseBody {
    Streamed(reqwest::Response),
    Buffered(Bytes),
    Empty,
}

/// One replica's response
#[derive(Debug)]
pub struct BackendResponse {
    /// Backend name the response came from
    pub backend: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl BackendResponse {
    /// Wrap an upstream response, keeping the body unconsumed
    pub fn from_upstream(backend: impl Into<String>, response: reqwest::Response) -> Self {
        Self {
            backend: backend.into(),
            status: response.status(),
            headers: response.headers().clone(),
            body: ResponseBody::Streamed(response),
        }
    }

    /// A response generated by the proxy itself (auth failures etc.)
    pub fn local(backend: impl Into<String>, status: StatusCode) -> Self {
        Self {
            backend: backend.into(),
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        }
    }

    /// 2xx/3xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success() || self.status.is_redirection()
    }

    /// 400..=499
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.status.is_client_error()
    }

    /// Read the body into memory so it can be inspected and still be
    /// forwarded to the client
    pub async fn buffer_body(&mut self) -> Result<Bytes> {
        match std::mem::replace(&mut self.body, ResponseBody::Empty) {
            ResponseBody::Streamed(response) => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;
                self.body = ResponseBody::Buffered(bytes.clone());
                Ok(bytes)
            }
            ResponseBody::Buffered(bytes) => {
                let out = bytes.clone();
                self.body = ResponseBody::Buffered(bytes);
                Ok(out)
            }
            ResponseBody::Empty => Ok(Bytes::new()),
        }
    }

    /// First integer value of the named header
    #[must_use]
    pub fn header_i64(&self, name: &str) -> Option<i64> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

/// Outcome of fanning a request out to the replicas of one (or all)
/// shards.
#[derive(Debug)]
pub struct Dispatched {
    pub results: Vec<Result<BackendResponse>>,
}

impl Dispatched {
    /// True iff every replica answered 2xx/3xx
    #[must_use]
    pub fn all_ok(&self) -> bool {
        !self.results.is_empty()
            && self
                .results
                .iter()
                .all(|r| r.as_ref().map(|resp| resp.is_success()).unwrap_or(false))
    }

    /// Pick the response to forward: the first 2xx/3xx, else the first
    /// response of any status, else the first error. Unpicked responses
    /// are dropped, which closes their connections.
    pub fn into_winner(self) -> Result<BackendResponse> {
        let mut first_response = None;
        let mut first_error = None;

        for result in self.results {
            match result {
                Ok(response) if response.is_success() => {
                    return Ok(response);
                }
                Ok(response) => {
                    if first_response.is_none() {
                        first_response = Some(response);
                    }
                }
                Err(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        match (first_response, first_error) {
            (Some(response), _) => Ok(response),
            (None, Some(error)) => Err(error),
            (None, None) => Err(Error::internal("dispatch produced no results")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(status: u16) -> Result<BackendResponse> {
        Ok(BackendResponse::local("b", StatusCode::from_u16(status).unwrap()))
    }

    #[test]
    fn test_all_ok() {
        let d = Dispatched { results: vec![local(200), local(301)] };
        assert!(d.all_ok());

        let d = Dispatched { results: vec![local(200), local(404)] };
        assert!(!d.all_ok());

        let d = Dispatched { results: vec![local(200), Err(Error::Timeout)] };
        assert!(!d.all_ok());

        let d = Dispatched { results: vec![] };
        assert!(!d.all_ok());
    }

    #[test]
    fn test_winner_prefers_success() {
        let d = Dispatched { results: vec![local(500), Err(Error::Timeout), local(200)] };
        assert_eq!(d.into_winner().unwrap().status, StatusCode::OK);
    }

    #[test]
    fn test_winner_falls_back_to_any_response() {
        let d = Dispatched { results: vec![Err(Error::Timeout), local(404)] };
        assert_eq!(d.into_winner().unwrap().status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_winner_error_when_no_response() {
        let d = Dispatched { results: vec![Err(Error::Timeout), Err(Error::Transport("x".into()))] };
        assert!(matches!(d.into_winner(), Err(Error::Timeout)));
    }
}
