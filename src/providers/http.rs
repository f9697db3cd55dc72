use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use super::ProviderError;

const USER_AGENT: &str = concat!("kwgroup/", env!("CARGO_PKG_VERSION"));

/// Longest response body kept in an error message
const MAX_ERROR_BODY: usize = 500;

pub fn client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .map_err(|err| ProviderError::Network(format!("failed to build http client: {err}")))
}

/// Send a request and decode a JSON body, mapping failures onto `ProviderError`.
pub fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ProviderError> {
    let resp = request.send().map_err(from_transport)?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp
            .text()
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        return Err(from_status(status, body));
    }

    resp.json::<T>().map_err(|err| {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if err.is_decode() {
            ProviderError::Malformed(format!("unexpected response envelope: {err}"))
        } else {
            ProviderError::Network(err.to_string())
        }
    })
}

pub fn from_status(status: StatusCode, body: String) -> ProviderError {
    let body = truncate(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(body),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimit(body),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderError::Timeout(body),
        s if s.is_server_error() => ProviderError::Network(format!("{s}: {body}")),
        s => ProviderError::Http {
            status: s.as_u16(),
            body,
        },
    }
}

pub fn from_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else {
        ProviderError::Network(err.to_string())
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push('…');
    }
    body
}
