use crate::EngineError;
use boxforge_schema::{ContainerConfig, ContainerId, ImageId};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tokio_util::sync::CancellationToken;

/// Blocking byte stream handed across the engine boundary.
pub type ByteStream = Box<dyn Read + Send>;

/// Read-only view of an engine image, used for cache matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    #[serde(rename = "Id")]
    pub id: ImageId,
    /// Empty for images without a parent.
    #[serde(rename = "Parent", default)]
    pub parent_id: String,
    #[serde(rename = "Comment", default)]
    pub comment: String,
    #[serde(rename = "Config", default)]
    pub config: Option<ContainerConfig>,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Option<Vec<String>>,
}

/// Entry of an image listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
    #[serde(rename = "Id")]
    pub id: ImageId,
    #[serde(rename = "ParentId", default)]
    pub parent_id: String,
}

/// Engine attach framing: stream byte, three zero bytes, big-endian length.
pub fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&[stream, 0, 0, 0]);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Live stdio of an attached container.
///
/// `output` carries the engine's combined stream: framed when the container
/// has no tty, raw otherwise. `input` is present only when stdin was
/// requested. Once the `stop` token given to
/// [`Engine::attach_container`] is cancelled, reads return end-of-stream and
/// writes fail with `BrokenPipe`.
pub struct Attachment {
    pub output: ByteStream,
    pub input: Option<Box<dyn Write + Send>>,
}

/// A container engine endpoint.
///
/// Every call blocks the caller. Implementations must be safe to share between
/// the build pipeline and its short-lived helper threads, which use distinct
/// streams concurrently.
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    fn create_container(&self, config: &ContainerConfig) -> Result<ContainerId, EngineError>;

    /// Starting an already running container is not an error.
    fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Snapshot the container's filesystem as a new image with `comment`
    /// recorded on it.
    fn commit_container(
        &self,
        id: &str,
        comment: &str,
        config: &ContainerConfig,
    ) -> Result<ImageId, EngineError>;

    /// Remove a container. A missing container yields
    /// [`EngineError::NotFound`].
    fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError>;

    /// Inspect an image by id or reference. A missing image yields
    /// [`EngineError::NotFound`].
    fn inspect_image(&self, reference: &str) -> Result<ImageRecord, EngineError>;

    /// All images, intermediate ones included, in engine order.
    fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError>;

    /// Start pulling `reference`. The returned stream is the engine's
    /// newline-delimited JSON progress; the pull is finished when it ends.
    fn pull_image(&self, reference: &str) -> Result<ByteStream, EngineError>;

    fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<(), EngineError>;

    /// Feed an image archive to the engine. The returned stream is the
    /// engine's newline-delimited JSON result; a transport-level success does
    /// not imply the load succeeded.
    fn load_image(&self, archive: ByteStream) -> Result<ByteStream, EngineError>;

    fn attach_container(
        &self,
        id: &str,
        stdin: bool,
        stop: &CancellationToken,
    ) -> Result<Attachment, EngineError>;

    /// Block until the container exits and return its status code, or
    /// [`EngineError::Cancelled`] once `cancel` fires.
    fn wait_container(&self, id: &str, cancel: &CancellationToken) -> Result<i64, EngineError>;

    /// Tar stream of `path` inside the container.
    fn copy_from_container(&self, id: &str, path: &str) -> Result<ByteStream, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_record_from_inspect_json() {
        let raw = r#"{
            "Id": "sha256:child",
            "Parent": "sha256:base",
            "Comment": "run echo hi",
            "Config": {"Cmd": ["echo", "hi"], "Env": null},
            "RepoTags": []
        }"#;
        let rec: ImageRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(rec.id, "sha256:child");
        assert_eq!(rec.parent_id, "sha256:base");
        assert_eq!(rec.comment, "run echo hi");
        assert_eq!(rec.config.unwrap().cmd.unwrap(), vec!["echo", "hi"]);
    }

    #[test]
    fn image_record_tolerates_missing_fields() {
        let rec: ImageRecord = serde_json::from_str(r#"{"Id": "sha256:x"}"#).unwrap();
        assert!(rec.parent_id.is_empty());
        assert!(rec.comment.is_empty());
        assert!(rec.config.is_none());
    }

    #[test]
    fn image_summary_from_listing_json() {
        let raw = r#"[{"Id": "sha256:a", "ParentId": "", "Size": 10},
                      {"Id": "sha256:b", "ParentId": "sha256:a"}]"#;
        let list: Vec<ImageSummary> = serde_json::from_str(raw).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].parent_id, "sha256:a");
    }
}
