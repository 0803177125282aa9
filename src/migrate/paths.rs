//! Path layout: how origin paths map to asset ids, destination keys and
//! manifest URLs.

use std::fmt;

use super::error::TransferError;

/// Identifier shared by every rendition of one media item: the last segment
/// of the directory holding the rendition files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque resume token of the origin listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalise to a single leading `/` and no trailing `/`; the root is `/`.
pub fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Parent directory of a normalised path.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Last segment of a normalised path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn join(dir: &str, name: &str) -> String {
    normalize(&format!("{}/{}", dir, name))
}

#[derive(Debug, Clone)]
pub struct PathLayout {
    source_root: String,
    dest_prefix: String,
    manifest_base: String,
}

impl PathLayout {
    pub fn new(source_root: &str, dest_prefix: &str, manifest_base: &str) -> Self {
        Self {
            source_root: normalize(source_root),
            dest_prefix: dest_prefix.trim_matches('/').to_string(),
            manifest_base: manifest_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn source_root(&self) -> &str {
        &self.source_root
    }

    /// Directory holding the renditions of the file at `path`.
    pub fn asset_dir<'a>(&self, path: &'a str) -> &'a str {
        parent(path)
    }

    pub fn asset_id(&self, path: &str) -> AssetId {
        AssetId::new(file_name(parent(path)))
    }

    /// Path relative to the source root, without a leading `/`.
    fn relative<'a>(&self, path: &'a str) -> Result<&'a str, TransferError> {
        if self.source_root == "/" {
            return Ok(path.trim_start_matches('/'));
        }
        match path.strip_prefix(self.source_root.as_str()) {
            Some("") => Ok(""),
            Some(rest) if rest.starts_with('/') => Ok(&rest[1..]),
            _ => Err(TransferError::Layout(format!(
                "{} is outside the source root {}",
                path, self.source_root
            ))),
        }
    }

    fn with_prefix(&self, relative: &str) -> String {
        match (self.dest_prefix.is_empty(), relative.is_empty()) {
            (true, _) => relative.to_string(),
            (false, true) => self.dest_prefix.clone(),
            (false, false) => format!("{}/{}", self.dest_prefix, relative),
        }
    }

    /// Object key for a source file: the destination prefix replaces the
    /// source root.
    pub fn destination_key(&self, source: &str) -> Result<String, TransferError> {
        let relative = self.relative(source)?;
        if relative.is_empty() {
            return Err(TransferError::Layout(format!(
                "{} names the source root, not a file",
                source
            )));
        }
        Ok(self.with_prefix(relative))
    }

    pub fn manifest_url(&self, asset_dir: &str, urlset: &str) -> Result<String, TransferError> {
        let dir = self.with_prefix(self.relative(asset_dir)?);
        let mut url = self.manifest_base.clone();
        if !dir.is_empty() {
            url.push('/');
            url.push_str(&dir);
        }
        url.push('/');
        url.push_str(urlset);
        Ok(url)
    }

    /// Listing boundary: every path under the root sorts before it.
    pub fn list_end(&self) -> Option<String> {
        if self.source_root == "/" {
            None
        } else {
            Some(format!("{}0", self.source_root))
        }
    }

    /// Cursor a fresh run starts from: the root or a subdirectory of it.
    pub fn start_cursor(&self, subdirectory: Option<&str>) -> Cursor {
        match subdirectory.map(|s| s.trim_matches('/')).filter(|s| !s.is_empty()) {
            Some(sub) => Cursor::new(join(&self.source_root, sub)),
            None => Cursor::new(self.source_root.clone()),
        }
    }
}
