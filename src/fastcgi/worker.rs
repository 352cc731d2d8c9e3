//! A single upstream connection bound to one request id.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::fastcgi::dispatcher::Target;
use crate::fastcgi::protocol::{self, RecordType, FCGI_KEEP_CONN, FCGI_RESPONDER, FCGI_VERSION_1};
use crate::fastcgi::FastCgiError;

/// One piece of upstream output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Stdout(Bytes),
    /// Anything that is not stdout; logged, never sent to the client.
    Stderr(Bytes),
}

/// Persistent connection to one FastCGI target.
///
/// Connects lazily and reconnects when the previous connection was closed,
/// either by us after a failed exchange or by the peer while idle.
#[derive(Debug)]
pub struct Worker {
    target: Target,
    request_id: u16,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    buf: BytesMut,
    in_flight: bool,
}

impl Worker {
    pub fn new(target: Target, request_id: u16, connect_timeout: Duration) -> Self {
        Self {
            target,
            request_id,
            connect_timeout,
            stream: None,
            buf: BytesMut::with_capacity(8 * 1024),
            in_flight: false,
        }
    }

    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// True between `begin` and the matching END_REQUEST.
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Drop the connection; the next exchange reconnects.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(upstream = %self.target, request_id = self.request_id, "FastCGI connection closed");
        }
        self.buf.clear();
        self.in_flight = false;
    }

    async fn ensure_connected(&mut self) -> Result<(), FastCgiError> {
        if let Some(stream) = &self.stream {
            if !is_idle_alive(stream) {
                tracing::debug!(upstream = %self.target, "Idle FastCGI connection went away, reconnecting");
                self.close();
            }
        }
        if self.stream.is_none() {
            let connect = TcpStream::connect((self.target.host.as_str(), self.target.port));
            let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(FastCgiError::Connect(e)),
                Err(_) => {
                    return Err(FastCgiError::Connect(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    )))
                }
            };
            let _ = stream.set_nodelay(true);
            tracing::debug!(upstream = %self.target, request_id = self.request_id, "FastCGI connection established");
            self.buf.clear();
            self.stream = Some(stream);
        }
        Ok(())
    }

    /// Send BEGIN_REQUEST, PARAMS and STDIN.
    ///
    /// `content_length` bytes are relayed from `body` in record-sized chunks,
    /// each read bounded by `timeout`.
    pub async fn begin<'a, P, R>(
        &mut self,
        params: P,
        body: &mut R,
        content_length: u64,
        timeout: Duration,
    ) -> Result<(), FastCgiError>
    where
        P: IntoIterator<Item = (&'a str, &'a str)>,
        R: AsyncRead + Unpin,
    {
        let request_id = self.request_id;
        let mut out = BytesMut::new();
        protocol::encode_stream(
            &mut out,
            RecordType::BeginRequest,
            request_id,
            &protocol::begin_request_body(FCGI_RESPONDER, FCGI_KEEP_CONN),
            false,
        );
        let pairs = protocol::encode_name_values(params);
        protocol::encode_stream(&mut out, RecordType::Params, request_id, &pairs, true);

        self.ensure_connected().await?;
        self.in_flight = true;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| FastCgiError::Protocol("no upstream connection".into()))?;
        stream.write_all(&out).await?;

        let mut remaining = content_length;
        let mut chunk = vec![0u8; protocol::MAX_CONTENT_LEN];
        while remaining > 0 {
            let want = remaining.min(protocol::MAX_CONTENT_LEN as u64) as usize;
            let n = tokio::time::timeout(timeout, body.read(&mut chunk[..want]))
                .await
                .map_err(|_| FastCgiError::Timeout)?
                .map_err(FastCgiError::Client)?;
            if n == 0 {
                return Err(FastCgiError::Client(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "request body ended early",
                )));
            }
            out.clear();
            protocol::encode_stream(&mut out, RecordType::Stdin, request_id, &chunk[..n], false);
            stream.write_all(&out).await?;
            remaining -= n as u64;
        }

        out.clear();
        protocol::encode_stream(&mut out, RecordType::Stdin, request_id, &[], true);
        stream.write_all(&out).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Next piece of output, or `None` once END_REQUEST arrives.
    ///
    /// Records carrying another version or request id are skipped.
    pub async fn next_output(&mut self, timeout: Duration) -> Result<Option<Output>, FastCgiError> {
        loop {
            while let Some(record) = protocol::decode(&mut self.buf) {
                let header = record.header;
                if header.version != FCGI_VERSION_1 || header.request_id != self.request_id {
                    tracing::debug!(
                        version = header.version,
                        request_id = header.request_id,
                        expected = self.request_id,
                        "Discarding stray FastCGI record"
                    );
                    continue;
                }
                return Ok(match RecordType::from_u8(header.record_type) {
                    Some(RecordType::EndRequest) => {
                        self.in_flight = false;
                        None
                    }
                    Some(RecordType::Stdout) => Some(Output::Stdout(record.content)),
                    _ => Some(Output::Stderr(record.content)),
                });
            }

            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| FastCgiError::Protocol("no upstream connection".into()))?;
            let n = tokio::time::timeout(timeout, stream.read_buf(&mut self.buf))
                .await
                .map_err(|_| FastCgiError::Timeout)??;
            if n == 0 {
                return Err(FastCgiError::Protocol(
                    "upstream closed the connection before END_REQUEST".into(),
                ));
            }
        }
    }
}

/// An idle upstream connection must have nothing to read and must not be at EOF.
fn is_idle_alive(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.try_read(&mut probe) {
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
        _ => false,
    }
}
