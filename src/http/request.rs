//! Request parsing.
//!
//! # Responsibilities
//! - Read the request line and header block off a buffered stream
//! - Validate the protocol version and negotiate keep-alive
//! - Enforce line-length and header-count limits
//! - Derive the CGI environment, virtual-host name and quality tables
//!
//! # Design Decisions
//! - Every line read shares the same timeout
//! - An empty request line is a lost connection, not an error
//! - Errors found after the full header block was read leave the connection usable

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::http::error::{HttpError, RequestError};
use crate::http::headers::HeaderMap;

/// Environment keys starting with this prefix stay inside the server.
pub const INTERNAL_ENV_PREFIX: &str = "httpd.";

/// Highest protocol version this server speaks.
pub const SERVER_VERSION: Version = Version { major: 1, minor: 1 };

/// HTTP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const HTTP_10: Version = Version { major: 1, minor: 0 };
    pub const HTTP_11: Version = Version { major: 1, minor: 1 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// CGI-style environment of a request.
///
/// Kept sorted so the parameters sent upstream are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgiEnv {
    vars: BTreeMap<String, String>,
}

impl CgiEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Pairs forwarded to a FastCGI application; internal keys are skipped.
    pub fn fastcgi_params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter()
            .filter(|(k, _)| !k.starts_with(INTERNAL_ENV_PREFIX))
    }

    fn join(&mut self, key: String, value: &str) {
        self.vars
            .entry(key)
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
}

/// Token → q-value table from an `Accept`-style header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualityTable {
    entries: Vec<(String, f32)>,
}

impl QualityTable {
    pub fn parse(raw: Option<&str>) -> Self {
        let mut entries = Vec::new();
        for item in raw.unwrap_or("").split(',') {
            let mut parts = item.split(';');
            let token = parts.next().unwrap_or("").trim();
            if token.is_empty() {
                continue;
            }
            let q = parts
                .filter_map(|p| p.trim().strip_prefix("q="))
                .next()
                .and_then(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            entries.push((token.to_ascii_lowercase(), q));
        }
        Self { entries }
    }

    /// q-value for `token`, if listed.
    pub fn quality(&self, token: &str) -> Option<f32> {
        self.entries
            .iter()
            .find(|(t, _)| t.eq_ignore_ascii_case(token))
            .map(|(_, q)| *q)
    }

    /// Listed with a nonzero q-value.
    pub fn accepts(&self, token: &str) -> bool {
        self.quality(token).is_some_and(|q| q > 0.0)
    }
}

/// A parsed request head.
#[derive(Debug, Clone)]
pub struct Request {
    /// The request line as received, for access logging.
    pub request_line: String,
    pub method: String,
    /// Request target as sent, including any query string.
    pub target: String,
    /// Target up to the first `?`.
    pub path: String,
    pub query: String,
    /// Version the client sent.
    pub version: Version,
    pub headers: HeaderMap,
    pub env: CgiEnv,
    /// Host name from the `Host` header, lowercased.
    pub hostname: Option<String>,
    /// Port from the `Host` header; absent when the header names none.
    pub port: Option<u16>,
    pub content_length: Option<u64>,
    pub keep_alive: bool,
    pub accept: QualityTable,
    pub accept_encoding: QualityTable,
}

impl Request {
    /// Version used for framing decisions: the lower of ours and the client's.
    pub fn negotiated_version(&self) -> Version {
        self.version.min(SERVER_VERSION)
    }

    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }
}

/// Limits applied while parsing.
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub timeout: Duration,
    pub max_line_bytes: usize,
    pub max_headers: usize,
}

fn bad_request(message: impl Into<String>, recoverable: bool) -> RequestError {
    RequestError::Http {
        error: HttpError::new(400, message),
        recoverable,
        request_line: None,
    }
}

/// Attach the request line to a parse failure for the access log.
fn with_line(err: RequestError, line: &str) -> RequestError {
    match err {
        RequestError::Http { error, recoverable, .. } => RequestError::Http {
            error,
            recoverable,
            request_line: Some(line.to_string()),
        },
        other => other,
    }
}

/// Keep-alive as the version and `Connection` header allow it.
///
/// `Connection: keep-alive` cannot extend HTTP/1.0, and a `Transfer-Encoding`
/// body cannot be skipped reliably.
fn negotiate_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    version >= Version::HTTP_11
        && !headers.has_token("connection", "close")
        && !headers.contains("transfer-encoding")
}

/// Read one line including its terminator. Returns an empty buffer at EOF.
async fn read_line<R>(reader: &mut R, opts: &ParseOptions) -> Result<Vec<u8>, RequestError>
where
    R: AsyncBufRead + Unpin,
{
    let limit = opts.max_line_bytes;
    let read = async {
        let mut line = Vec::new();
        loop {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(line);
            }
            let (chunk, done) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (&available[..=i], true),
                None => (available, false),
            };
            if line.len() + chunk.len() > limit {
                return Err(bad_request("Line too long", false));
            }
            line.extend_from_slice(chunk);
            let used = chunk.len();
            reader.consume(used);
            if done {
                return Ok(line);
            }
        }
    };
    tokio::time::timeout(opts.timeout, read)
        .await
        .map_err(|_| RequestError::Timeout)?
}

fn decode_line(raw: &[u8]) -> String {
    // Header bytes are ISO-8859-1 on the wire.
    raw.iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

fn parse_version(raw: &str) -> Result<Version, RequestError> {
    let bad = || bad_request(format!("Bad request version ({:?})", raw), false);
    let numbers = raw.strip_prefix("HTTP/").ok_or_else(bad)?;
    let (major, minor) = numbers.split_once('.').ok_or_else(bad)?;
    let major = major.parse::<u16>().map_err(|_| bad())?;
    let minor = minor.parse::<u16>().map_err(|_| bad())?;
    if major >= 2 {
        return Err(RequestError::Http {
            error: HttpError::new(505, format!("Invalid HTTP Version ({})", raw)),
            recoverable: false,
            request_line: None,
        });
    }
    Ok(Version::new(major, minor))
}

/// Split a `Host` value into name and optional port.
pub fn parse_host(host: &str) -> (Option<String>, Option<u16>) {
    let host = host.trim();
    if host.is_empty() {
        return (None, None);
    }
    let (name, port) = if let Some(rest) = host.strip_prefix('[') {
        match rest.split_once(']') {
            Some((name, tail)) => (name, tail.strip_prefix(':')),
            None => (host, None),
        }
    } else if host.matches(':').count() > 1 {
        // Bare IPv6 literal without brackets.
        (host, None)
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) => (name, Some(port)),
            None => (host, None),
        }
    };
    let port = port.and_then(|p| p.parse::<u16>().ok());
    (Some(name.to_ascii_lowercase()), port)
}

/// Read one request head.
///
/// `Ok(None)` means the peer closed the connection (or sent an empty line)
/// before a request started.
pub async fn read_request<R>(
    reader: &mut R,
    opts: &ParseOptions,
    base_env: &CgiEnv,
) -> Result<Option<Request>, RequestError>
where
    R: AsyncBufRead + Unpin,
{
    let raw = read_line(reader, opts).await?;
    let request_line = decode_line(&raw).trim().to_string();
    if request_line.is_empty() {
        return Ok(None);
    }

    let words: Vec<&str> = request_line.split_whitespace().collect();
    if words.len() != 3 {
        return Err(with_line(
            bad_request(format!("Bad request syntax ({:?})", request_line), false),
            &request_line,
        ));
    }
    let method = words[0].to_string();
    let target = words[1].to_string();
    let version = parse_version(words[2]).map_err(|e| with_line(e, &request_line))?;

    // Header block. A malformed line is reported once the block is consumed.
    let mut fields: Vec<(String, String)> = Vec::new();
    let mut deferred: Option<String> = None;
    loop {
        let raw = read_line(reader, opts)
            .await
            .map_err(|e| with_line(e, &request_line))?;
        let line = decode_line(&raw);
        if line.trim().is_empty() {
            break;
        }
        if fields.len() >= opts.max_headers {
            return Err(with_line(bad_request("Too many headers", false), &request_line));
        }
        if line.starts_with([' ', '\t']) {
            match fields.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => {
                    deferred.get_or_insert_with(|| "Bad header continuation".to_string());
                }
            }
            continue;
        }
        match line.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => {
                fields.push((name.trim().to_string(), value.trim().to_string()));
            }
            _ => {
                deferred.get_or_insert_with(|| format!("Bad header line ({:?})", line));
            }
        }
    }

    let mut headers = HeaderMap::new();
    for (name, value) in &fields {
        headers.append_joined(name, value);
    }
    let mut keep_alive = negotiate_keep_alive(version, &headers);

    if let Some(message) = deferred {
        // The body was never delimited; reading on would parse it as a request.
        let body_declared = headers.contains("content-length");
        return Err(with_line(
            bad_request(message, keep_alive && !body_declared),
            &request_line,
        ));
    }

    let content_length = match headers.get("content-length") {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(n) => Some(n),
            Err(_) => {
                keep_alive = false;
                None
            }
        },
        None => None,
    };

    let mut env = base_env.clone();
    env.set("SERVER_PROTOCOL", version.to_string());
    env.set("REQUEST_METHOD", method.clone());
    env.set("CONTENT_TYPE", headers.get("content-type").unwrap_or(""));
    env.set("CONTENT_LENGTH", headers.get("content-length").unwrap_or(""));
    for (name, value) in &fields {
        let key = name.replace('-', "_").to_ascii_uppercase();
        if env.contains(&key) {
            continue;
        }
        env.join(format!("HTTP_{}", key), value);
    }
    env.set("REQUEST_URI", target.clone());

    let (hostname, port) = match env.get("HTTP_HOST") {
        Some(host) => parse_host(host),
        None => (None, None),
    };

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target.clone(), String::new()),
    };

    let accept = QualityTable::parse(headers.get("accept"));
    let accept_encoding = QualityTable::parse(headers.get("accept-encoding"));

    Ok(Some(Request {
        request_line,
        method,
        target,
        path,
        query,
        version,
        headers,
        env,
        hostname,
        port,
        content_length,
        keep_alive,
        accept,
        accept_encoding,
    }))
}
