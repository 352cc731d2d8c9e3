//! Filesystem reads used by the file and directory handlers.

use std::io::{self, SeekFrom};
use std::path::Path;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Bytes read per body chunk.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// One visible entry of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Directory entries without dotfiles: directories first, each group
/// sorted case-insensitively.
pub async fn list_dir(path: &Path) -> io::Result<Vec<DirEntry>> {
    let mut reader = tokio::fs::read_dir(path).await?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        // Follow symlinks so linked directories list as directories.
        let meta = match tokio::fs::metadata(entry.path()).await {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        entries.push(DirEntry {
            name,
            is_dir: meta.is_dir(),
            size: meta.len(),
        });
    }
    entries.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_uppercase().cmp(&b.name.to_uppercase()))
    });
    Ok(entries)
}

/// `512`, `1.50 KB`, `2.00 MB`, ...
pub fn human_size(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if size < 1024 {
        return format!("{} B", size);
    }
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// A byte range of a file, read in [`CHUNK_SIZE`] pieces.
#[derive(Debug)]
pub struct FileBody {
    file: File,
    remaining: u64,
}

impl FileBody {
    pub async fn open(path: &Path, start: u64, len: u64) -> io::Result<Self> {
        let mut file = File::open(path).await?;
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }
        Ok(Self {
            file,
            remaining: len,
        })
    }

    /// Next chunk, or `None` once the range is exhausted.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let want = self.remaining.min(CHUNK_SIZE as u64) as usize;
        let mut buf = vec![0u8; want];
        let n = self.file.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shrank while being sent",
            ));
        }
        buf.truncate(n);
        self.remaining -= n as u64;
        Ok(Some(Bytes::from(buf)))
    }
}
