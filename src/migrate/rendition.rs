use std::collections::BTreeMap;

use crate::origin::Entry;

/// Renditions kept per asset, highest bitrate first.
pub const MAX_RENDITIONS: usize = 3;

/// Suffix of the adaptive-streaming manifest the CDN serves for an urlset.
pub const MANIFEST_SUFFIX: &str = ".urlset/master.m3u8";

/// One bitrate variant of an asset, named relative to the asset directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendition {
    pub rank: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Ordered by descending rank.
    pub renditions: Vec<Rendition>,
    /// Manifest file name relative to the asset directory.
    pub urlset: String,
}

/// Pieces of a rendition file name: `a_1500.mp4` is `("a_", "1500", ".mp4")`.
struct NameParts<'a> {
    base: &'a str,
    digits: &'a str,
    ext: &'a str,
}

fn split_name(name: &str) -> Option<NameParts<'_>> {
    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };
    let base = stem.trim_end_matches(|c: char| c.is_ascii_digit());
    let digits = &stem[base.len()..];
    if digits.is_empty() {
        return None;
    }
    Some(NameParts { base, digits, ext })
}

/// Picks the renditions to migrate out of one asset directory.
#[derive(Debug, Clone)]
pub struct RenditionSelector {
    /// Lowercase, without the dot. Empty accepts any extension.
    extensions: Vec<String>,
}

impl RenditionSelector {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    fn accepts_extension(&self, ext: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        self.extensions.iter().any(|e| *e == ext)
    }

    /// Whether a listed file could be a rendition, judged by its name alone.
    pub fn is_candidate(&self, name: &str) -> bool {
        let name = name.rsplit('/').next().unwrap_or(name);
        split_name(name).is_some_and(|parts| self.accepts_extension(parts.ext))
    }

    /// Selects up to [`MAX_RENDITIONS`] files with the highest trailing
    /// numeric rank. Duplicate ranks keep the last-listed file. Returns
    /// `None` when no entry qualifies.
    pub fn select(&self, entries: &[Entry]) -> Option<Selection> {
        let mut by_rank: BTreeMap<u64, &str> = BTreeMap::new();

        for entry in entries.iter().filter(|e| e.is_file()) {
            let name = entry.name.rsplit('/').next().unwrap_or(&entry.name);
            let Some(parts) = split_name(name) else {
                tracing::debug!("Skipping {}: no numeric rank", name);
                continue;
            };
            if !self.accepts_extension(parts.ext) {
                continue;
            }
            let Ok(rank) = parts.digits.parse::<u64>() else {
                tracing::warn!("Skipping {}: rank {} out of range", name, parts.digits);
                continue;
            };
            if let Some(previous) = by_rank.insert(rank, name) {
                tracing::warn!(
                    "Duplicate rendition rank {}: {} replaces {}",
                    rank,
                    name,
                    previous
                );
            }
        }

        if by_rank.is_empty() {
            return None;
        }

        let renditions: Vec<Rendition> = by_rank
            .into_iter()
            .rev()
            .take(MAX_RENDITIONS)
            .map(|(rank, name)| Rendition {
                rank,
                name: name.to_string(),
            })
            .collect();
        let urlset = urlset_name(&renditions);
        Some(Selection { renditions, urlset })
    }
}

/// `a_,9,5,3,.mp4.urlset/master.m3u8` when every rendition shares a base
/// name and extension, otherwise `,a_9.mp4,b_5.mp4,.urlset/master.m3u8`.
fn urlset_name(renditions: &[Rendition]) -> String {
    let parts: Vec<NameParts<'_>> = renditions
        .iter()
        .filter_map(|r| split_name(&r.name))
        .collect();

    let shared = parts.len() == renditions.len()
        && parts
            .windows(2)
            .all(|w| w[0].base == w[1].base && w[0].ext == w[1].ext);

    if shared {
        if let Some(first) = parts.first() {
            let labels: Vec<&str> = parts.iter().map(|p| p.digits).collect();
            return format!(
                "{},{},{}{}",
                first.base,
                labels.join(","),
                first.ext,
                MANIFEST_SUFFIX
            );
        }
    }

    let names: Vec<&str> = renditions.iter().map(|r| r.name.as_str()).collect();
    format!(",{},{}", names.join(","), MANIFEST_SUFFIX)
}
