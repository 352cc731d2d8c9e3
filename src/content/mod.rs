//! Content collaborators: MIME types, filesystem reads and HTML pages.

pub mod fs;
pub mod mime;
pub mod template;

pub use mime::MimeTypes;
