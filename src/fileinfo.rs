//! Per-worker file metadata cache.
//!
//! Handlers stat files constantly (existence checks, `Last-Modified`,
//! `ETag`, content length); each worker keeps a small TTL'd cache so a
//! hot path is stat'ed once per interval instead of once per request.
//! The cycle-logs server event drops every entry.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

/// Stat snapshot of one path.
#[derive(Debug)]
pub struct FileInfo {
    pub path: PathBuf,
    pub exists: bool,
    pub is_directory: bool,
    pub size: u64,
    pub mtime: SystemTime,
    pub inode: u64,
    pub etag: String,
    pub mime_type: String,
}

impl FileInfo {
    fn stat(path: &Path, mime: &MimeTypes) -> FileInfo {
        match fs::metadata(path) {
            Ok(meta) => FileInfo {
                path: path.to_owned(),
                exists: true,
                is_directory: meta.is_dir(),
                size: meta.len(),
                mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                inode: meta.ino(),
                etag: format!(
                    "\"{:x}-{:x}-{:x}\"",
                    meta.ino(),
                    meta.len(),
                    meta.mtime()
                ),
                mime_type: mime.of(path).to_owned(),
            },
            Err(_) => FileInfo {
                path: path.to_owned(),
                exists: false,
                is_directory: false,
                size: 0,
                mtime: SystemTime::UNIX_EPOCH,
                inode: 0,
                etag: String::new(),
                mime_type: String::new(),
            },
        }
    }
}

/// Extension to MIME type table, immutable after configuration.
#[derive(Debug, Clone)]
pub struct MimeTypes {
    map: HashMap<String, String>,
    default: String,
}

impl MimeTypes {
    pub fn new(default: impl Into<String>) -> MimeTypes {
        let mut map = HashMap::new();
        for (ext, ty) in &[
            ("html", "text/html"),
            ("htm", "text/html"),
            ("css", "text/css"),
            ("js", "application/javascript"),
            ("json", "application/json"),
            ("txt", "text/plain"),
            ("xml", "application/xml"),
            ("png", "image/png"),
            ("jpg", "image/jpeg"),
            ("jpeg", "image/jpeg"),
            ("gif", "image/gif"),
            ("svg", "image/svg+xml"),
            ("ico", "image/x-icon"),
            ("pdf", "application/pdf"),
            ("wasm", "application/wasm"),
        ] {
            map.insert((*ext).to_owned(), (*ty).to_owned());
        }
        MimeTypes {
            map,
            default: default.into(),
        }
    }

    pub fn insert(&mut self, ext: impl Into<String>, ty: impl Into<String>) {
        self.map.insert(ext.into(), ty.into());
    }

    pub fn of(&self, path: &Path) -> &str {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.map.get(&ext.to_ascii_lowercase()))
            .map(String::as_str)
            .unwrap_or(&self.default)
    }
}

impl Default for MimeTypes {
    fn default() -> MimeTypes {
        MimeTypes::new("application/octet-stream")
    }
}

/// The cache itself; owned by one worker, no interior locking.
pub struct FileInfoCache {
    entries: HashMap<PathBuf, (Instant, Rc<FileInfo>)>,
    ttl: Duration,
    mime: MimeTypes,
}

impl FileInfoCache {
    pub fn new(ttl: Duration, mime: MimeTypes) -> FileInfoCache {
        FileInfoCache {
            entries: HashMap::new(),
            ttl,
            mime,
        }
    }

    /// Cached metadata for `path`, re-stat'ed when the entry aged out.
    pub fn query(&mut self, path: &Path) -> Rc<FileInfo> {
        let now = Instant::now();
        if let Some((stamp, info)) = self.entries.get(path) {
            if now.duration_since(*stamp) < self.ttl {
                return Rc::clone(info);
            }
        }
        let info = Rc::new(FileInfo::stat(path, &self.mime));
        self.entries
            .insert(path.to_owned(), (now, Rc::clone(&info)));
        info
    }

    pub fn invalidate(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    /// Drops everything; wired to the server's cycle-logs event.
    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
