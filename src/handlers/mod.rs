//! Request handlers.
//!
//! # Data Flow
//! ```text
//! Resolved handler chain (router.rs)
//!     → handle() per step, in order
//!     → NoMatch: try the next step
//!     → Complete: response already written or fully staged
//!     → Stream: connection writes the body source
//! ```

pub mod directory;
pub mod fastcgi;
pub mod file;
pub mod proxy;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::content::fs::FileBody;
use crate::http::context::{Connection, Exchange};
use crate::http::error::ServerError;
use crate::http::request::Request;
use crate::routing::router::HandlerOptions;

/// The closed set of built-in handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    File,
    Directory,
    FastCgi,
    Proxy,
    /// Literal error response.
    Error(u16),
    NotFound,
}

impl Handler {
    /// Handler by configuration name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "file" => Some(Handler::File),
            "dir" | "directory" => Some(Handler::Directory),
            "fastcgi" | "fcgi" => Some(Handler::FastCgi),
            "proxy" => Some(Handler::Proxy),
            "not_found" => Some(Handler::NotFound),
            _ => None,
        }
    }
}

/// What a handler did with the request.
#[derive(Debug)]
pub enum Outcome {
    /// Not applicable; the next handler runs.
    NoMatch,
    /// The response is complete apart from finishing.
    Complete,
    /// Headers are staged; the body comes from this source.
    Stream(BodySource),
}

/// Body produced by a handler and written by the connection.
#[derive(Debug)]
pub enum BodySource {
    Bytes(Bytes),
    File(FileBody),
}

/// Run one handler against the current request.
pub async fn handle<S>(
    handler: Handler,
    conn: &mut Connection<S>,
    exchange: &Exchange,
    options: &HandlerOptions,
) -> Result<Outcome, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match handler {
        Handler::File => file::handle(conn, exchange, options).await,
        Handler::Directory => directory::handle(conn, exchange, options).await,
        Handler::FastCgi => fastcgi::handle(conn, exchange, options).await,
        Handler::Proxy => proxy::handle(conn, exchange).await,
        Handler::Error(code) => {
            conn.send_error(code, None).await?;
            Ok(Outcome::Complete)
        }
        Handler::NotFound => {
            conn.send_error(404, None).await?;
            Ok(Outcome::Complete)
        }
    }
}

/// Answer `405` unless the method is GET or HEAD. Returns true when rejected.
async fn reject_unless_read<S>(conn: &mut Connection<S>, request: &Request) -> Result<bool, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = request.method.as_str();
    if method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD") {
        return Ok(false);
    }
    conn.send_error_with(405, None, &[("Allow", "GET, HEAD")]).await?;
    Ok(true)
}
