use std::collections::{HashMap, HashSet};

use super::paths::{self, AssetId, PathLayout};

/// An asset seen for the first time this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAsset {
    pub id: AssetId,
    /// Normalised origin directory holding the renditions.
    pub dir: String,
}

/// What a listed file means for discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// First sighting of an asset directory.
    New(DiscoveredAsset),
    /// A second directory maps to an id already claimed by `known_dir`.
    /// Reported once per colliding directory.
    Collision {
        id: AssetId,
        dir: String,
        known_dir: String,
    },
}

/// Turns the flat file listing into one discovery per asset.
///
/// The listing returns every rendition file, so an asset directory shows up
/// many times within a page and across pages; only the first sighting
/// triggers rendition selection.
#[derive(Debug)]
pub struct AssetGrouper {
    layout: PathLayout,
    seen: HashMap<AssetId, String>,
    collisions: HashSet<String>,
}

impl AssetGrouper {
    pub fn new(layout: PathLayout) -> Self {
        Self {
            layout,
            seen: HashMap::new(),
            collisions: HashSet::new(),
        }
    }

    /// Returns `None` for every sighting after the first.
    pub fn on_file(&mut self, path: &str) -> Option<Discovery> {
        let path = paths::normalize(path);
        let dir = self.layout.asset_dir(&path).to_string();
        let id = self.layout.asset_id(&path);

        if let Some(known_dir) = self.seen.get(&id) {
            if *known_dir != dir && self.collisions.insert(dir.clone()) {
                tracing::warn!(
                    "Asset id {} already claimed by {}; not migrating {}",
                    id,
                    known_dir,
                    dir
                );
                return Some(Discovery::Collision {
                    id,
                    dir,
                    known_dir: known_dir.clone(),
                });
            }
            return None;
        }

        self.seen.insert(id.clone(), dir.clone());
        Some(Discovery::New(DiscoveredAsset { id, dir }))
    }

    pub fn discovered(&self) -> usize {
        self.seen.len()
    }
}
