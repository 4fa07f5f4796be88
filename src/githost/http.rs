//! Smart-HTTP transport for the internal git server.
//!
//! Three endpoints per repo: ref advertisement, fetch, push. The heavy
//! lifting is delegated to `git upload-pack` / `git receive-pack` in
//! stateless-rpc mode; this module does pkt-line framing, content
//! negotiation, and the push hook that feeds the trigger bus.
//!
//! Push is authenticated implicitly by the orchestrator's network
//! boundary; there is no per-user auth on the git plane.

use std::io::Read;
use std::process::Stdio;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use super::diff_refs;
use crate::api::SharedState;
use crate::events::Event;

/// Parameters for the info/refs advertisement request.
#[derive(Debug, Deserialize)]
pub struct InfoRefsParams {
    pub service: String,
}

pub fn git_router() -> Router<SharedState> {
    Router::new()
        .route("/git/{repo}/info/refs", get(info_refs))
        .route("/git/{repo}/git-upload-pack", post(upload_pack))
        .route("/git/{repo}/git-receive-pack", post(receive_pack))
        .layer(axum::extract::DefaultBodyLimit::disable())
}

fn content_type(service: &str, advertisement: bool) -> String {
    if advertisement {
        format!("application/x-{}-advertisement", service)
    } else {
        format!("application/x-{}-result", service)
    }
}

/// `"3.git"` → `3`.
fn parse_repo_segment(segment: &str) -> Option<i64> {
    segment.strip_suffix(".git")?.parse().ok()
}

/// Length-prefixed pkt-line, e.g. `001e# service=git-upload-pack\n`.
fn pkt_line(data: &str) -> String {
    format!("{:04x}{}", data.len() + 4, data)
}

const FLUSH_PKT: &str = "0000";

fn git_error(status: StatusCode, message: String) -> Response {
    (status, message).into_response()
}

/// Decompress the request body when the client gzipped it.
fn decode_body(headers: &HeaderMap, body: Bytes) -> Result<Vec<u8>, std::io::Error> {
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("gzip"))
        .unwrap_or(false);
    if !gzipped {
        return Ok(body.to_vec());
    }
    let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Run the named git service in stateless-rpc mode against the bare repo.
async fn run_service(
    repo_path: &std::path::Path,
    service: &str,
    advertise: bool,
    input: &[u8],
) -> Result<Vec<u8>, String> {
    let subcommand = match service {
        "git-upload-pack" => "upload-pack",
        "git-receive-pack" => "receive-pack",
        other => return Err(format!("unsupported service '{}'", other)),
    };
    let mut cmd = tokio::process::Command::new("git");
    cmd.arg(subcommand).arg("--stateless-rpc");
    if advertise {
        cmd.arg("--advertise-refs");
    }
    cmd.arg(repo_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("failed to spawn git {}: {}", subcommand, e))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input)
            .await
            .map_err(|e| format!("failed to write {} input: {}", subcommand, e))?;
        drop(stdin);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("git {} failed: {}", subcommand, e))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("git {} exited non-zero: {}", subcommand, stderr.trim()));
    }
    Ok(output.stdout)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn info_refs(
    State(state): State<SharedState>,
    Path(repo): Path<String>,
    Query(params): Query<InfoRefsParams>,
) -> Response {
    let Some(repo_id) = parse_repo_segment(&repo) else {
        return git_error(StatusCode::NOT_FOUND, "not a git repository".into());
    };
    if !matches!(params.service.as_str(), "git-upload-pack" | "git-receive-pack") {
        return git_error(
            StatusCode::BAD_REQUEST,
            format!("unsupported service '{}'", params.service),
        );
    }
    if !state.githost.is_ingested(repo_id) {
        return git_error(StatusCode::NOT_FOUND, format!("repo {} not found", repo_id));
    }

    let path = state.githost.repo_path(repo_id);
    match run_service(&path, &params.service, true, &[]).await {
        Ok(refs) => {
            let mut body = Vec::new();
            body.extend_from_slice(pkt_line(&format!("# service={}\n", params.service)).as_bytes());
            body.extend_from_slice(FLUSH_PKT.as_bytes());
            body.extend_from_slice(&refs);
            (
                [
                    (header::CONTENT_TYPE, content_type(&params.service, true)),
                    (header::CACHE_CONTROL, "no-cache".to_string()),
                ],
                body,
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(repo_id, error = %e, "ref advertisement failed");
            git_error(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn upload_pack(
    State(state): State<SharedState>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(repo_id) = parse_repo_segment(&repo) else {
        return git_error(StatusCode::NOT_FOUND, "not a git repository".into());
    };
    if !state.githost.is_ingested(repo_id) {
        return git_error(StatusCode::NOT_FOUND, format!("repo {} not found", repo_id));
    }
    let input = match decode_body(&headers, body) {
        Ok(input) => input,
        Err(e) => return git_error(StatusCode::BAD_REQUEST, format!("bad request body: {}", e)),
    };

    let path = state.githost.repo_path(repo_id);
    match run_service(&path, "git-upload-pack", false, &input).await {
        Ok(out) => (
            [
                (header::CONTENT_TYPE, content_type("git-upload-pack", false)),
                (header::CACHE_CONTROL, "no-cache".to_string()),
            ],
            out,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(repo_id, error = %e, "upload-pack failed");
            git_error(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

/// Push endpoint. Serialized per repo; every accepted ref update is fed
/// to the event bus for the trigger service.
async fn receive_pack(
    State(state): State<SharedState>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(repo_id) = parse_repo_segment(&repo) else {
        return git_error(StatusCode::NOT_FOUND, "not a git repository".into());
    };
    if !state.githost.is_ingested(repo_id) {
        return git_error(StatusCode::NOT_FOUND, format!("repo {} not found", repo_id));
    }
    let input = match decode_body(&headers, body) {
        Ok(input) => input,
        Err(e) => return git_error(StatusCode::BAD_REQUEST, format!("bad request body: {}", e)),
    };

    let lock = state.githost.repo_lock(repo_id).await;
    let _guard = lock.lock().await;

    let before = match state.githost.refs_snapshot(repo_id).await {
        Ok(snapshot) => snapshot,
        Err(e) => return git_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let path = state.githost.repo_path(repo_id);
    let out = match run_service(&path, "git-receive-pack", false, &input).await {
        Ok(out) => out,
        Err(e) => {
            tracing::error!(repo_id, error = %e, "receive-pack failed");
            return git_error(StatusCode::INTERNAL_SERVER_ERROR, e);
        }
    };

    match state.githost.refs_snapshot(repo_id).await {
        Ok(after) => {
            for update in diff_refs(repo_id, &before, &after) {
                tracing::info!(
                    repo_id,
                    ref_name = %update.ref_name,
                    new_sha = %update.new_sha,
                    "push accepted"
                );
                state.store.bus().publish(Event::PushReceived {
                    repo_id,
                    ref_name: update.ref_name,
                    old_sha: update.old_sha,
                    new_sha: update.new_sha,
                });
            }
        }
        Err(e) => {
            tracing::error!(repo_id, error = %e, "post-receive ref scan failed");
        }
    }

    (
        [
            (header::CONTENT_TYPE, content_type("git-receive-pack", false)),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        out,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkt_line_length_prefix() {
        assert_eq!(pkt_line("# service=git-upload-pack\n"), "001e# service=git-upload-pack\n");
        assert_eq!(pkt_line(""), "0004");
    }

    #[test]
    fn repo_segment_parsing() {
        assert_eq!(parse_repo_segment("3.git"), Some(3));
        assert_eq!(parse_repo_segment("42.git"), Some(42));
        assert_eq!(parse_repo_segment("3"), None);
        assert_eq!(parse_repo_segment("x.git"), None);
    }

    #[test]
    fn content_types_match_git_protocol() {
        assert_eq!(
            content_type("git-upload-pack", true),
            "application/x-git-upload-pack-advertisement"
        );
        assert_eq!(
            content_type("git-receive-pack", false),
            "application/x-git-receive-pack-result"
        );
    }

    #[test]
    fn decode_body_passthrough_without_encoding() {
        let headers = HeaderMap::new();
        let body = Bytes::from_static(b"0000");
        assert_eq!(decode_body(&headers, body).unwrap(), b"0000");
    }

    #[test]
    fn decode_body_handles_gzip() {
        use flate2::{Compression, write::GzEncoder};
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"packfile-bytes").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
        let decoded = decode_body(&headers, Bytes::from(compressed)).unwrap();
        assert_eq!(decoded, b"packfile-bytes");
    }
}
