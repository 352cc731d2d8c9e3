//! `CONNECT` tunnels. Absolute-URI forwarding is refused.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::fastcgi::parse_target;
use crate::handlers::Outcome;
use crate::http::context::{Connection, Exchange};
use crate::http::error::ServerError;

pub async fn handle<S>(conn: &mut Connection<S>, exchange: &Exchange) -> Result<Outcome, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = &exchange.request;
    if request.method.eq_ignore_ascii_case("CONNECT") {
        let Some(target) = parse_target(&request.target) else {
            conn.send_error(400, Some("CONNECT needs a host:port target")).await?;
            return Ok(Outcome::Complete);
        };
        let timeout = conn.context().connect_timeout;
        let connect = TcpStream::connect((target.host.as_str(), target.port));
        let upstream = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(upstream = %target, error = %e, "Tunnel connect failed");
                conn.send_error(502, Some("Failed connecting to the requested host")).await?;
                return Ok(Outcome::Complete);
            }
            Err(_) => {
                tracing::warn!(upstream = %target, "Tunnel connect timed out");
                conn.send_error(504, None).await?;
                return Ok(Outcome::Complete);
            }
        };
        tracing::debug!(connection_id = %conn.id(), upstream = %target, "Tunnel open");
        conn.tunnel(upstream).await?;
        return Ok(Outcome::Complete);
    }

    if request.target.contains("://") {
        conn.send_error(501, Some("Forwarding absolute URIs is not supported")).await?;
        return Ok(Outcome::Complete);
    }
    Ok(Outcome::NoMatch)
}
