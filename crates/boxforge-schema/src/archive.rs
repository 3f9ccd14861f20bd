//! Index documents of a loadable image archive.
//!
//! An archive carries three members, always in this order: the image config
//! blob (`<id>.json`), the legacy `repositories` index, and `manifest.json`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const REPOSITORIES: &str = "repositories";
pub const MANIFEST: &str = "manifest.json";

/// `{ "<repo>": { "<tag>": "<image id>" } }`
pub type Repositories = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags")]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

/// Archive member name of the image config blob.
pub fn config_member(id: &str) -> String {
    format!("{id}.json")
}

/// Path of the layer tarball the manifest refers to.
pub fn layer_member(id: &str) -> String {
    format!("{id}/layer.tar")
}

/// Repository index naming the image after its own id.
pub fn repositories_for(id: &str) -> Repositories {
    let mut tags = BTreeMap::new();
    tags.insert("latest".to_owned(), id.to_owned());
    let mut repos = BTreeMap::new();
    repos.insert(id.to_owned(), tags);
    repos
}

pub fn manifest_for(id: &str) -> Vec<ManifestEntry> {
    vec![ManifestEntry {
        config: config_member(id),
        repo_tags: vec![id.to_owned()],
        layers: vec![layer_member(id)],
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repositories_shape() {
        let json = serde_json::to_string(&repositories_for("img1")).unwrap();
        assert_eq!(json, r#"{"img1":{"latest":"img1"}}"#);
    }

    #[test]
    fn manifest_shape() {
        let json = serde_json::to_value(manifest_for("img1")).unwrap();
        assert_eq!(json[0]["Config"], "img1.json");
        assert_eq!(json[0]["RepoTags"][0], "img1");
        assert_eq!(json[0]["Layers"][0], "img1/layer.tar");
        assert_eq!(json.as_array().unwrap().len(), 1);
    }
}
