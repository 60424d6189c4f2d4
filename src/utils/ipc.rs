//! Minimal HTTP-over-Unix-socket client used by the thin one-shot CLI
//! subcommands (`status`, `ports`) to talk to a running `vibetrees serve`
//! daemon over [`crate::utils::paths::control_socket_path`], reusing the
//! same Control API routes and wire types the browser UI uses rather than a
//! second protocol (§11).

use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

/// Issues a `GET` request for `path` against the daemon listening on the
/// control socket, and deserializes the JSON response body as `T`.
///
/// # Errors
/// Returns an error if the daemon isn't listening on the control socket, the
/// connection is lost mid-request, or the response isn't valid JSON for `T`.
pub async fn get_json<T: serde::de::DeserializeOwned>(path: &str) -> anyhow::Result<T> {
    let socket_path = super::paths::control_socket_path();
    let stream = UnixStream::connect(&socket_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect to vibetrees daemon at {}: {e}", socket_path.display()))?;

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::debug!(%err, "ipc connection closed");
        }
    });

    let request = Request::builder().uri(path).header("Host", "localhost").body(Empty::<Bytes>::new())?;
    let response = sender.send_request(request).await?;
    if !response.status().is_success() {
        anyhow::bail!("daemon returned {} for {path}", response.status());
    }

    let body = response.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&body)?)
}
