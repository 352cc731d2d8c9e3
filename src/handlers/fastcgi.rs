//! FastCGI handler: relays the request to a pooled upstream and streams
//! its output back as the response.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::fastcgi::{FastCgiError, Output};
use crate::handlers::Outcome;
use crate::http::context::{Connection, Exchange};
use crate::http::error::ServerError;
use crate::http::response::ResponseState;
use crate::routing::router::HandlerOptions;
use crate::routing::rules::find_file;

/// Ceiling for the CGI header block an application may send.
const MAX_HEAD_BYTES: usize = 64 * 1024;

pub async fn handle<S>(
    conn: &mut Connection<S>,
    exchange: &Exchange,
    options: &HandlerOptions,
) -> Result<Outcome, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = &exchange.request;
    let vhost = &exchange.vhost;
    let resolved = vhost.resolve_path(&request.target, &options.root);
    let Some(rule) = vhost.fastcgi_rule(&resolved.realpath) else {
        return Ok(Outcome::NoMatch);
    };
    let index = rule.index.as_deref().unwrap_or(&options.index);
    let Some(script) = find_file(&resolved.realpath, index) else {
        return Ok(Outcome::NoMatch);
    };
    let script = std::path::absolute(&script).unwrap_or(script);

    let mut env = request.env.clone();
    env.set("DOCUMENT_ROOT", resolved.doc_root.as_str());
    env.set("DOCUMENT_URI", resolved.path.as_str());
    env.set("SCRIPT_NAME", resolved.path.as_str());
    env.set("QUERY_STRING", resolved.query.as_str());
    env.set("SCRIPT_FILENAME", script.to_string_lossy());
    env.set(
        "SERVER_NAME",
        request.hostname.clone().unwrap_or_else(|| vhost.host.clone()),
    );
    env.set("REDIRECT_STATUS", conn.response().status().to_string());

    let body_len = if request.method.eq_ignore_ascii_case("POST") {
        request.content_length.unwrap_or(0)
    } else {
        0
    };

    tracing::debug!(
        connection_id = %conn.id(),
        rule = %rule.id,
        script = %script.display(),
        "FastCGI request"
    );
    let dispatcher = conn.context().dispatchers.get(rule.id, &rule.targets);
    let mut lease = dispatcher.acquire().await?;

    if body_len > 0 {
        conn.continue_if_expected().await?;
    }
    lease
        .begin(env.fastcgi_params(), conn.body_reader(), body_len, rule.timeout)
        .await?;
    conn.mark_body_consumed(body_len);

    let mut head = Vec::new();
    let mut in_body = false;
    while let Some(output) = lease.next_output(rule.timeout).await? {
        match output {
            Output::Stderr(data) => {
                tracing::warn!(
                    target: "httpd_fcgi::fastcgi",
                    rule = %rule.id,
                    "{}",
                    String::from_utf8_lossy(&data).trim_end()
                );
            }
            Output::Stdout(data) if in_body => conn.write(&data).await?,
            Output::Stdout(data) => {
                head.extend_from_slice(&data);
                if let Some(body_start) = head_end(&head) {
                    apply_head(conn.response_mut(), &head[..body_start])?;
                    in_body = true;
                    conn.send_headers().await?;
                    if body_start < head.len() {
                        conn.write(&head[body_start..]).await?;
                    }
                    head = Vec::new();
                } else if head.len() > MAX_HEAD_BYTES {
                    return Err(FastCgiError::Protocol("CGI header block too large".into()).into());
                }
            }
        }
    }
    if !in_body && !head.is_empty() {
        // Output ended inside the header block; take what arrived.
        apply_head(conn.response_mut(), &head)?;
    }
    Ok(Outcome::Complete)
}

/// Offset just past the blank line ending the CGI header block.
fn head_end(buf: &[u8]) -> Option<usize> {
    let mut line_start = 0;
    while let Some(pos) = buf[line_start..].iter().position(|&b| b == b'\n') {
        let end = line_start + pos;
        let line = &buf[line_start..end];
        if line.is_empty() || line == b"\r" {
            return Some(end + 1);
        }
        line_start = end + 1;
    }
    None
}

fn parse_head(head: &[u8]) -> Vec<(String, String)> {
    String::from_utf8_lossy(head)
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Copy CGI headers onto the response. `Status` sets the status line.
fn apply_head(response: &mut ResponseState, head: &[u8]) -> Result<(), ServerError> {
    for (name, value) in parse_head(head) {
        if name.eq_ignore_ascii_case("status") {
            let (code, message) = value.split_once(' ').unwrap_or((value.as_str(), ""));
            let code = code
                .parse::<u16>()
                .ok()
                .filter(|c| (100..=999).contains(c))
                .ok_or_else(|| FastCgiError::Protocol(format!("invalid Status header: {}", value)))?;
            let message = message.trim();
            response.set_status(code, (!message.is_empty()).then(|| message.to_string()))?;
        } else if name.eq_ignore_ascii_case("set-cookie") {
            response.append_header(&name, value)?;
        } else {
            response.set_header(&name, value)?;
        }
    }
    Ok(())
}
