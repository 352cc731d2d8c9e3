//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (accept loop, one task per connection)
//!     → context.rs (per-connection request loop)
//!     → request.rs (request line, headers, CGI environment)
//!     → routing layer picks the virtual host and handler chain
//!     → handlers stage headers and produce a body
//!     → response.rs (status, headers, framing decision)
//!     → writer.rs (chunked / buffered / gzip layers)
//!     → Send to client
//! ```

pub mod context;
pub mod error;
pub mod headers;
pub mod request;
pub mod response;
pub mod server;
pub mod status;
pub mod writer;

pub use context::{Connection, Exchange, ServerContext};
pub use error::{HttpError, RequestError, ServerError};
pub use server::HttpServer;
