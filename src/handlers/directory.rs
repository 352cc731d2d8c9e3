//! Directory listing handler.

use std::path::Path;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::content::fs::list_dir;
use crate::content::template;
use crate::handlers::{reject_unless_read, BodySource, Outcome};
use crate::http::context::{Connection, Exchange};
use crate::http::error::ServerError;
use crate::routing::router::HandlerOptions;

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
    let dir = Path::new(&resolved.realpath);
    let is_dir = tokio::fs::metadata(dir).await.map(|m| m.is_dir()).unwrap_or(false);
    if !is_dir {
        return Ok(Outcome::NoMatch);
    }
    if reject_unless_read(conn, request).await? {
        return Ok(Outcome::Complete);
    }

    if !resolved.path.ends_with('/') {
        let mut location = format!("{}/", request.path);
        if !request.query.is_empty() {
            location.push('?');
            location.push_str(&request.query);
        }
        conn.redirect(&location, 301).await?;
        return Ok(Outcome::Complete);
    }

    let entries = match list_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(path = %dir.display(), error = %e, "Directory not listable");
            return Ok(Outcome::NoMatch);
        }
    };
    let page = template::directory_listing(&resolved.path, &entries);
    let response = conn.response_mut();
    response.set_header("Content-Type", "text/html")?;
    response.set_header("Content-Length", page.len().to_string())?;
    if request.is_head() {
        return Ok(Outcome::Complete);
    }
    Ok(Outcome::Stream(BodySource::Bytes(Bytes::from(page))))
}
