//! Static file handler.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::content::fs::FileBody;
use crate::handlers::{reject_unless_read, BodySource, Outcome};
use crate::http::context::{Connection, Exchange};
use crate::http::error::ServerError;
use crate::routing::router::HandlerOptions;
use crate::routing::rules::find_file;

const OCTET_STREAM: &str = "application/octet-stream";

pub async fn handle<S>(
    conn: &mut Connection<S>,
    exchange: &Exchange,
    options: &HandlerOptions,
) -> Result<Outcome, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = &exchange.request;
    let resolved = exchange.vhost.resolve_path(&request.target, &options.root);
    let Some(path) = find_file(&resolved.realpath, &options.index) else {
        return Ok(Outcome::NoMatch);
    };
    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "File vanished before serving");
            return Ok(Outcome::NoMatch);
        }
    };
    if reject_unless_read(conn, request).await? {
        return Ok(Outcome::Complete);
    }

    let size = meta.len();
    let mime = conn.context().mime.guess(&path);
    let expiry = conn.context().mime.expiry(&mime);

    let response = conn.response_mut();
    response.set_header("Content-Type", mime.as_str())?;
    response.set_header("Accept-Ranges", "bytes")?;
    if mime == OCTET_STREAM {
        if let Some(name) = path.file_name() {
            let name = name.to_string_lossy().replace('"', "");
            response.set_header("Content-Disposition", format!("attachment; filename=\"{}\"", name))?;
        }
    }
    if let Some(secs) = expiry {
        response.set_header("Cache-Control", format!("max-age={}, must-revalidate", secs))?;
        if let Ok(modified) = meta.modified() {
            response.set_header("Last-Modified", httpdate::fmt_http_date(modified))?;
            if not_modified(request.headers.get("if-modified-since"), modified) {
                response.set_status(304, None)?;
                return Ok(Outcome::Complete);
            }
        }
    }

    let (start, len) = match request.headers.get("range") {
        None => (0, size),
        Some(raw) => match parse_range(raw, size) {
            Some((start, end)) => {
                let response = conn.response_mut();
                response.set_status(206, None)?;
                response.set_header("Content-Range", format!("bytes {}-{}/{}", start, end, size))?;
                (start, end - start + 1)
            }
            None => {
                conn.send_error(400, Some("Invalid or unsatisfiable range")).await?;
                return Ok(Outcome::Complete);
            }
        },
    };
    conn.response_mut().set_header("Content-Length", len.to_string())?;
    if request.is_head() {
        return Ok(Outcome::Complete);
    }
    let body = FileBody::open(&path, start, len).await?;
    Ok(Outcome::Stream(BodySource::File(body)))
}

/// Single `bytes=start-[end]` range as inclusive offsets; the end is clamped
/// to the file. Suffix and multi-part ranges are not supported.
fn parse_range(raw: &str, size: u64) -> Option<(u64, u64)> {
    let spec = raw.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let last = size.checked_sub(1)?;
    let end = match end.trim() {
        "" => last,
        end => end.parse::<u64>().ok()?.min(last),
    };
    (start <= end).then_some((start, end))
}

/// True when `modified` is not newer than the `If-Modified-Since` date.
fn not_modified(since: Option<&str>, modified: SystemTime) -> bool {
    let Some(since) = since.and_then(|raw| httpdate::parse_http_date(raw).ok()) else {
        return false;
    };
    // HTTP dates carry whole seconds.
    let secs = |t: SystemTime| t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    secs(modified) <= secs(since)
}
