// src/docroot.rs
//! Mapping request URLs onto files under a fixed document root.

use crate::error::{EtudeError, EtudeResult};
use crate::http::HttpCode;
use memmap2::Mmap;
use std::fs::File;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Longest URL path accepted for resolution.
pub const FILENAME_LEN: usize = 200;
pub const DEFAULT_INDEX: &str = "index.html";
pub const DEFAULT_CONTENT_TYPE: &str = "text/html";

/// How the `Content-Type` of a served file is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentTypePolicy {
    /// Same type for every file.
    Fixed(String),
    /// Guess from the file extension, falling back to `application/octet-stream`.
    Guess,
}

impl ContentTypePolicy {
    pub fn content_type<'a>(&'a self, path: &Path) -> &'a str {
        match self {
            ContentTypePolicy::Fixed(ty) => ty.as_str(),
            ContentTypePolicy::Guess => mime_guess::from_path(path)
                .first_raw()
                .unwrap_or("application/octet-stream"),
        }
    }
}

impl Default for ContentTypePolicy {
    fn default() -> Self {
        ContentTypePolicy::Fixed(DEFAULT_CONTENT_TYPE.to_string())
    }
}

/// A file ready to be sent: its canonical path and a read-only mapping.
#[derive(Debug)]
pub struct Resolved {
    pub path: PathBuf,
    pub map: Mmap,
}

#[derive(Debug, Clone)]
pub struct DocRoot {
    root: PathBuf,
    index: String,
    content_type: ContentTypePolicy,
}

impl DocRoot {
    /// Canonicalises `root` once; every resolved file must live under it.
    pub fn new(root: impl AsRef<Path>) -> EtudeResult<Self> {
        let root = root.as_ref();
        let canonical = root.canonicalize().map_err(|e| {
            EtudeError::config(format!("document root {}: {e}", root.display()))
        })?;
        if !canonical.is_dir() {
            return Err(EtudeError::config(format!(
                "document root {} is not a directory",
                canonical.display()
            )));
        }
        Ok(Self {
            root: canonical,
            index: DEFAULT_INDEX.to_string(),
            content_type: ContentTypePolicy::default(),
        })
    }

    pub fn index(mut self, name: impl Into<String>) -> Self {
        self.index = name.into();
        self
    }

    pub fn content_type(mut self, policy: ContentTypePolicy) -> Self {
        self.content_type = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content_type_for(&self, path: &Path) -> &str {
        self.content_type.content_type(path)
    }

    /// Resolve a request path to a mapped file, or the outcome explaining why not.
    pub fn resolve(&self, url: &str) -> Result<Resolved, HttpCode> {
        let path = url.split(['?', '#']).next().unwrap_or_default();
        if path.len() > FILENAME_LEN || path.contains('\0') || !path.starts_with('/') {
            return Err(HttpCode::BadRequest);
        }
        if path.split('/').any(|seg| seg == "..") {
            return Err(HttpCode::BadRequest);
        }

        let relative = match path.trim_start_matches('/') {
            "" => self.index.as_str(),
            rest => rest,
        };
        let candidate = self.root.join(relative);

        let real = candidate.canonicalize().map_err(open_failure)?;
        if !real.starts_with(&self.root) {
            tracing::debug!(path = %real.display(), "resolved outside document root");
            return Err(HttpCode::ForbiddenRequest);
        }

        let meta = real.metadata().map_err(open_failure)?;
        if meta.is_dir() {
            return Err(HttpCode::ForbiddenRequest);
        }
        if meta.permissions().mode() & 0o004 == 0 {
            return Err(HttpCode::ForbiddenRequest);
        }
        if meta.len() == 0 {
            return Err(HttpCode::BadRequest);
        }

        let file = File::open(&real).map_err(open_failure)?;
        // SAFETY: the mapping is read-only and lives only as long as one
        // response; files under the root are not expected to be truncated
        // while being served.
        let map = unsafe { Mmap::map(&file) }.map_err(|e| {
            tracing::warn!(path = %real.display(), error = %e, "mmap failed");
            HttpCode::InternalError
        })?;
        Ok(Resolved { path: real, map })
    }
}

fn open_failure(err: io::Error) -> HttpCode {
    match err.kind() {
        io::ErrorKind::PermissionDenied => HttpCode::ForbiddenRequest,
        _ => HttpCode::NoResource,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn site() -> (tempfile::TempDir, DocRoot) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"<h1>home</h1>").unwrap();
        fs::write(dir.path().join("style.css"), b"body{}").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/page.html"), b"page").unwrap();
        let root = DocRoot::new(dir.path()).unwrap();
        (dir, root)
    }

    #[test]
    fn test_root_maps_to_index() {
        let (_dir, root) = site();
        let res = root.resolve("/").unwrap();
        assert_eq!(&res.map[..], b"<h1>home</h1>");
        assert!(res.path.ends_with("index.html"));

        let res = root.resolve("/sub/page.html?x=1#top").unwrap();
        assert_eq!(&res.map[..], b"page");
    }

    #[test]
    fn test_missing_and_malformed() {
        let (_dir, root) = site();
        assert_eq!(root.resolve("/nope.html").unwrap_err(), HttpCode::NoResource);
        assert_eq!(root.resolve("/../etc/passwd").unwrap_err(), HttpCode::BadRequest);
        assert_eq!(root.resolve("/sub/../index.html").unwrap_err(), HttpCode::BadRequest);
        assert_eq!(root.resolve("/a\0b").unwrap_err(), HttpCode::BadRequest);
        let long = format!("/{}", "a".repeat(FILENAME_LEN));
        assert_eq!(root.resolve(&long).unwrap_err(), HttpCode::BadRequest);
    }

    #[test]
    fn test_forbidden_cases() {
        let (dir, root) = site();
        assert_eq!(root.resolve("/sub").unwrap_err(), HttpCode::ForbiddenRequest);

        let secret = dir.path().join("secret.html");
        fs::write(&secret, b"shh").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();
        assert_eq!(root.resolve("/secret.html").unwrap_err(), HttpCode::ForbiddenRequest);
    }

    #[test]
    fn test_symlink_cannot_escape() {
        let (dir, root) = site();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("leak.html");
        fs::write(&target, b"leak").unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("leak.html")).unwrap();
        assert_eq!(root.resolve("/leak.html").unwrap_err(), HttpCode::ForbiddenRequest);
    }

    #[test]
    fn test_empty_file_is_bad_request() {
        let (dir, root) = site();
        fs::write(dir.path().join("empty.html"), b"").unwrap();
        assert_eq!(root.resolve("/empty.html").unwrap_err(), HttpCode::BadRequest);
    }

    #[test]
    fn test_content_type_policy() {
        let (_dir, root) = site();
        let css = root.resolve("/style.css").unwrap();
        assert_eq!(root.content_type_for(&css.path), "text/html");

        let root = root.content_type(ContentTypePolicy::Guess);
        assert_eq!(root.content_type_for(&css.path), "text/css");
        assert_eq!(
            root.content_type_for(Path::new("blob.unknownext")),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_bad_root_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DocRoot::new(dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, EtudeError::Config(_)));

        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(DocRoot::new(&file), Err(EtudeError::Config(_))));
    }
}
