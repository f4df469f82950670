use std::time::Duration;

use once_cell::sync::OnceCell;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};

use crate::error::FetchError;

const REQUEST_TIMEOUT_SECS: u64 = 60;
const ERROR_SNIPPET_CHARS: usize = 220;
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/121.0";

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared blocking client. Stats endpoints are slow from cloud hosts, hence the long timeout.
pub fn http_client() -> Result<&'static Client, FetchError> {
    CLIENT.get_or_try_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::Transport(format!("failed to build http client: {e}")))
    })
}

/// Sends `req` and returns the body of a 2xx response. 429 maps to `RateLimited`; other
/// failures carry a one-line snippet of the body.
pub fn send_for_text(req: RequestBuilder) -> Result<String, FetchError> {
    let resp = req.send()?;
    let status = resp.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(FetchError::RateLimited);
    }
    let body = resp.text()?;
    if !status.is_success() {
        return Err(FetchError::Http {
            status: status.as_u16(),
            body: snippet(&body),
        });
    }
    Ok(body)
}

fn snippet(body: &str) -> String {
    body.trim()
        .replace(['\n', '\r'], " ")
        .chars()
        .take(ERROR_SNIPPET_CHARS)
        .collect()
}
