//! Shared HTTP plumbing for the transports
//!
//! URL construction for the connect/reconnect/send/abort/ping endpoints,
//! plus the send and abort requests the HTTP-based transports share.

use crate::connection::negotiate::CLIENT_PROTOCOL;
use crate::error::ClientError;
use crate::transport::{TransportContext, TransportKind};
use tracing::warn;
use url::Url;

/// Build the HTTP client the transports and the core connection share.
/// When `with_credentials` is set the client keeps a cookie jar so
/// authentication cookies survive across negotiate, connect and send.
pub(crate) fn client(with_credentials: bool) -> reqwest::Client {
    reqwest::Client::builder()
        .cookie_store(with_credentials)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Accumulates raw response bytes and yields complete lines.
///
/// Chunk boundaries from the HTTP stream can fall in the middle of a
/// multi-byte character, so bytes are only decoded once a full line has
/// been assembled.
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append a chunk and return the lines it completed, with the
    /// trailing newline (and any carriage return) stripped.
    pub(crate) fn split(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

/// Build `{base}/{action}` with the standard query parameters.
pub(crate) fn endpoint_url(
    ctx: &TransportContext,
    action: &str,
    transport: Option<TransportKind>,
) -> Result<Url, ClientError> {
    let base = ctx.url.trim_end_matches('/');
    let mut url = Url::parse(&format!("{}/{}", base, action))
        .map_err(|e| ClientError::InvalidUrl(format!("{}/{}: {}", base, action, e)))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("clientProtocol", CLIENT_PROTOCOL);
        if let Some(kind) = transport {
            pairs.append_pair("transport", kind.name());
        }
        pairs.append_pair("connectionToken", &ctx.connection_token);
        if let Some(data) = &ctx.connection_data {
            pairs.append_pair("connectionData", data);
        }
        for (key, value) in &ctx.query {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

/// Rewrite an http(s) URL to its ws(s) equivalent.
pub(crate) fn to_ws_scheme(url: &mut Url) -> Result<(), ClientError> {
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ClientError::InvalidUrl(format!(
                "cannot derive a WebSocket scheme from '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| ClientError::InvalidUrl(format!("cannot set scheme on {}", url)))
}

/// POST a payload through the HTTP send endpoint.
pub(crate) async fn post_send(
    http: &reqwest::Client,
    ctx: &TransportContext,
    kind: TransportKind,
    data: &str,
) -> Result<(), ClientError> {
    let url = endpoint_url(ctx, "send", Some(kind))?;
    let response = http.post(url.clone()).form(&[("data", data)]).send().await?;
    if !response.status().is_success() {
        return Err(ClientError::HttpStatus {
            status: response.status().as_u16(),
            url: url.to_string(),
        });
    }
    Ok(())
}

/// Notify the server that the connection is going away. Failures are
/// logged, not propagated; the local teardown proceeds regardless.
pub(crate) async fn notify_abort(
    http: &reqwest::Client,
    ctx: &TransportContext,
    kind: TransportKind,
) {
    let url = match endpoint_url(ctx, "abort", Some(kind)) {
        Ok(url) => url,
        Err(e) => {
            warn!(error = %e, "could not build abort URL");
            return;
        }
    };
    if let Err(e) = http.post(url).body("").send().await {
        warn!(error = %e, transport = kind.name(), "abort notification failed");
    }
}
