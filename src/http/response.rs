//! Per-request response state and header finalisation.
//!
//! # Responsibilities
//! - Hold status and headers until they are sent, refusing changes afterwards
//! - Decide gzip vs identity and Content-Length vs chunked vs close
//! - Add the `Connection`, `Server` and `Date` headers
//! - Serialise the header block

use std::time::SystemTime;

use crate::http::error::ServerError;
use crate::http::headers::HeaderMap;
use crate::http::request::{Request, Version};
use crate::http::status;

/// `Server` header value.
pub const SERVER_SOFTWARE: &str = concat!("httpd-fcgi/", env!("CARGO_PKG_VERSION"));

/// What the response needs to know about its request.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub version: Version,
    pub head: bool,
    pub accepts_gzip: bool,
    pub keep_alive: bool,
    pub gzip_types: Vec<String>,
}

impl RequestInfo {
    pub fn from_request(request: &Request, gzip_types: &[String]) -> Self {
        Self {
            version: request.negotiated_version(),
            head: request.is_head(),
            accepts_gzip: request.accept_encoding.accepts("gzip"),
            keep_alive: request.keep_alive,
            gzip_types: gzip_types.to_vec(),
        }
    }

    fn gzip_eligible(&self, content_type: &str) -> bool {
        let mime = content_type.split(';').next().unwrap_or("").trim();
        self.gzip_types.iter().any(|t| t.eq_ignore_ascii_case(mime))
    }
}

impl Default for RequestInfo {
    /// Used for errors raised before a request could be parsed.
    fn default() -> Self {
        Self {
            version: Version::HTTP_11,
            head: false,
            accepts_gzip: false,
            keep_alive: false,
            gzip_types: Vec::new(),
        }
    }
}

/// Body framing chosen when the headers were sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    pub chunked: bool,
    pub gzip: bool,
    /// False for HEAD and for statuses that never carry a body.
    pub body_allowed: bool,
    pub keep_alive: bool,
}

/// Status and headers of the response being built.
#[derive(Debug)]
pub struct ResponseState {
    status: u16,
    message: Option<String>,
    headers: HeaderMap,
    headers_sent: bool,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self {
            status: 200,
            message: None,
            headers: HeaderMap::new(),
            headers_sent: false,
        }
    }
}

impl ResponseState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset every per-request field.
    pub fn clean(&mut self) {
        *self = Self::default();
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    fn guard(&self) -> Result<(), ServerError> {
        if self.headers_sent {
            Err(ServerError::HeadersSent)
        } else {
            Ok(())
        }
    }

    pub fn set_status(&mut self, status: u16, message: Option<String>) -> Result<(), ServerError> {
        self.guard()?;
        self.status = status;
        self.message = message;
        Ok(())
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> Result<(), ServerError> {
        self.guard()?;
        self.headers.set(name, value);
        Ok(())
    }

    pub fn append_header(&mut self, name: &str, value: impl Into<String>) -> Result<(), ServerError> {
        self.guard()?;
        self.headers.append(name, value);
        Ok(())
    }

    pub fn remove_header(&mut self, name: &str) -> Result<(), ServerError> {
        self.guard()?;
        self.headers.remove(name);
        Ok(())
    }

    /// Drop all headers, e.g. before replacing the response with an error page.
    pub fn clear_headers(&mut self) -> Result<(), ServerError> {
        self.guard()?;
        self.headers.clear();
        Ok(())
    }

    /// Finalise the headers and mark them sent.
    pub fn prepare(&mut self, info: &RequestInfo) -> Result<Framing, ServerError> {
        self.guard()?;
        let bodiless = status::is_bodiless(self.status);
        let mut keep_alive = info.keep_alive && !self.headers.has_token("connection", "close");
        let mut chunked = false;
        let mut gzip = false;

        if !bodiless {
            let eligible = self
                .headers
                .get("content-type")
                .is_some_and(|ct| info.gzip_eligible(ct));
            if self.status == 200
                && info.accepts_gzip
                && eligible
                && !self.headers.contains("content-encoding")
            {
                gzip = true;
                self.headers.set("Content-Encoding", "gzip");
                self.headers.remove("content-length");
            }
            if !self.headers.contains("content-length") {
                if info.version >= Version::HTTP_11 {
                    chunked = true;
                    self.headers.set("Transfer-Encoding", "chunked");
                } else {
                    keep_alive = false;
                }
            }
        }

        self.headers.set("Connection", if keep_alive { "keep-alive" } else { "close" });
        if !self.headers.contains("server") {
            self.headers.set("Server", SERVER_SOFTWARE);
        }
        self.headers.set("Date", httpdate::fmt_http_date(SystemTime::now()));
        self.headers_sent = true;

        Ok(Framing {
            chunked,
            gzip,
            body_allowed: !bodiless && !info.head,
            keep_alive,
        })
    }

    /// Mark the headers sent without finalising them (raw tunnels).
    pub fn mark_sent(&mut self) {
        self.headers_sent = true;
    }

    /// Status line and header block, ISO-8859-1 encoded.
    pub fn encode_head(&self) -> Vec<u8> {
        let message = self
            .message
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| status::reason(self.status));
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, message);
        for (name, value) in self.headers.iter() {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        head.chars()
            .map(|c| if (c as u32) < 256 { c as u8 } else { b'?' })
            .collect()
    }
}
