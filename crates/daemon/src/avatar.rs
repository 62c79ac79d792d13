//! Persisted avatar identities.
//!
//! Layout: `<avatars_dir>/<id>/metadata.json` plus `<avatars_dir>/<id>/frames/`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use image::RgbImage;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::face::FaceRegion;
use crate::job::validate_identifier;
use crate::media::MediaBackend;

const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarAsset {
    #[serde(rename = "avatar_id")]
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Paths relative to the avatar directory, in order
    pub reference_frames: Vec<PathBuf>,
    /// Known face location in the reference frames
    #[serde(default)]
    pub face_region: Option<FaceRegion>,
    #[serde(default, rename = "custom_metadata")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct AvatarStore {
    root: PathBuf,
}

impl AvatarStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        AvatarStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn avatar_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.avatar_dir(id).join(METADATA_FILE)
    }

    pub fn exists(&self, id: &str) -> bool {
        validate_identifier("avatar id", id).is_ok() && self.metadata_path(id).is_file()
    }

    pub fn load(&self, id: &str) -> Result<AvatarAsset> {
        validate_identifier("avatar id", id)?;
        let path = self.metadata_path(id);
        if !path.is_file() {
            return Err(PipelineError::avatar_not_found(id));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Every readable avatar, sorted by id
    pub fn list(&self) -> Result<Vec<AvatarAsset>> {
        let mut avatars = Vec::new();
        if !self.root.exists() {
            return Ok(avatars);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match self.load(&id) {
                Ok(avatar) => avatars.push(avatar),
                Err(e) => warn!("Skipping avatar directory {}: {}", entry.path().display(), e),
            }
        }
        avatars.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(avatars)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        validate_identifier("avatar id", id)?;
        let dir = self.avatar_dir(id);
        if !dir.is_dir() {
            return Err(PipelineError::avatar_not_found(id));
        }
        fs::remove_dir_all(&dir)?;
        info!("Avatar {} deleted", id);
        Ok(())
    }

    /// Register a new avatar from already-selected reference frames
    pub fn import(&self, name: &str, frames: &[PathBuf], face_region: Option<FaceRegion>) -> Result<AvatarAsset> {
        if frames.is_empty() {
            return Err(PipelineError::Validation("at least one reference frame is required".to_string()));
        }
        self.create(name, face_region, serde_json::Map::new(), |dir, frames_dir| {
            self.copy_frames(frames, dir, frames_dir)
        })
    }

    /// Register a new avatar from decoded frames, stored as PNG
    pub fn import_images(
        &self,
        name: &str,
        images: &[RgbImage],
        face_region: Option<FaceRegion>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<AvatarAsset> {
        if images.is_empty() {
            return Err(PipelineError::Validation("at least one reference frame is required".to_string()));
        }
        self.create(name, face_region, metadata, |dir, frames_dir| {
            let mut out = Vec::with_capacity(images.len());
            for (i, img) in images.iter().enumerate() {
                let dest = frames_dir.join(format!("frame_{:04}.png", i));
                img.save(&dest)?;
                out.push(dest.strip_prefix(dir).map(Path::to_path_buf).unwrap_or(dest));
            }
            Ok(out)
        })
    }

    /// Register a new avatar from a source video.
    ///
    /// Frames are sampled evenly, `max_frames` at most.
    pub async fn import_video(
        &self,
        media: &dyn MediaBackend,
        name: &str,
        video: &Path,
        max_frames: usize,
        face_region: Option<FaceRegion>,
    ) -> Result<AvatarAsset> {
        let frames = sample_video_frames(media, video, max_frames).await?;
        if frames.is_empty() {
            return Err(PipelineError::Validation(format!("no frames decoded from {}", video.display())));
        }
        let mut metadata = serde_json::Map::new();
        metadata.insert("source_video".into(), serde_json::json!(video.display().to_string()));
        self.import_images(name, &frames, face_region, metadata)
    }

    fn create<F>(
        &self,
        name: &str,
        face_region: Option<FaceRegion>,
        metadata: serde_json::Map<String, serde_json::Value>,
        write_frames: F,
    ) -> Result<AvatarAsset>
    where
        F: FnOnce(&Path, &Path) -> Result<Vec<PathBuf>>,
    {
        if name.trim().is_empty() {
            return Err(PipelineError::Validation("avatar name is empty".to_string()));
        }

        let id = generate_id(name);
        let dir = self.avatar_dir(&id);
        let frames_dir = dir.join("frames");
        fs::create_dir_all(&frames_dir)?;

        let reference_frames = match write_frames(&dir, &frames_dir) {
            Ok(paths) => paths,
            Err(e) => {
                // Leave nothing half-imported behind
                if let Err(cleanup) = fs::remove_dir_all(&dir) {
                    warn!("Failed to remove partial avatar {}: {}", dir.display(), cleanup);
                }
                return Err(e);
            }
        };

        let avatar = AvatarAsset {
            id: id.clone(),
            name: name.trim().to_string(),
            created_at: Utc::now(),
            updated_at: None,
            reference_frames,
            face_region,
            metadata,
        };
        self.save(&avatar)?;
        info!("Avatar {} imported with {} frames", id, avatar.reference_frames.len());
        Ok(avatar)
    }

    fn copy_frames(&self, frames: &[PathBuf], dir: &Path, frames_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::with_capacity(frames.len());
        for (i, src) in frames.iter().enumerate() {
            // Decode once so unreadable images are rejected up front
            image::open(src).map_err(|e| {
                PipelineError::Validation(format!("unreadable reference frame {}: {}", src.display(), e))
            })?;
            let ext = src
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase)
                .unwrap_or_else(|| "png".to_string());
            let dest = frames_dir.join(format!("frame_{:04}.{}", i, ext));
            fs::copy(src, &dest)?;
            debug!("Copied {} -> {}", src.display(), dest.display());
            out.push(dest.strip_prefix(dir).map(Path::to_path_buf).unwrap_or(dest));
        }
        Ok(out)
    }

    /// Reference frame `index`, or frame 0 when out of range
    pub fn reference_frame(&self, id: &str, index: usize) -> Result<RgbImage> {
        let avatar = self.load(id)?;
        let rel = avatar
            .reference_frames
            .get(index)
            .or_else(|| avatar.reference_frames.first())
            .ok_or_else(|| PipelineError::Validation(format!("avatar {} has no reference frames", id)))?;
        let path = self.avatar_dir(id).join(rel);
        if !path.is_file() {
            return Err(PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("reference frame missing: {}", path.display()),
            )));
        }
        Ok(image::open(&path)?.to_rgb8())
    }

    /// Merge `updates` into the avatar's custom metadata
    pub fn update_metadata(
        &self,
        id: &str,
        updates: serde_json::Map<String, serde_json::Value>,
    ) -> Result<AvatarAsset> {
        let mut avatar = self.load(id)?;
        avatar.metadata.extend(updates);
        avatar.updated_at = Some(Utc::now());
        self.save(&avatar)?;
        Ok(avatar)
    }

    fn save(&self, avatar: &AvatarAsset) -> Result<()> {
        let path = self.metadata_path(&avatar.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(avatar)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Every `step`-th frame of `video`, where `step` spreads `max_frames` over the clip
pub async fn sample_video_frames(media: &dyn MediaBackend, video: &Path, max_frames: usize) -> Result<Vec<RgbImage>> {
    if max_frames == 0 {
        return Err(PipelineError::Validation("max_frames must be greater than zero".to_string()));
    }
    let (info, mut source) = media.open_video(video).await?;
    let step = (info.frame_count / max_frames).max(1);
    debug!(
        "Sampling every {} of {} frames from {}",
        step,
        info.frame_count,
        video.display()
    );

    let mut frames = Vec::new();
    let mut index = 0;
    while let Some(frame) = source.next_frame().await? {
        if index % step == 0 {
            frames.push(frame);
            if frames.len() >= max_frames {
                break;
            }
        }
        index += 1;
    }
    Ok(frames)
}

/// Id derived from a display name: sanitized slug plus a random suffix
pub fn generate_id(name: &str) -> String {
    let mut slug: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    slug.truncate(40);
    let slug = slug.trim_matches('_');
    let slug = if slug.is_empty() { "avatar" } else { slug };
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", slug, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MemoryBackend;

    fn write_png(dir: &Path, name: &str, value: u8) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(16, 16, image::Rgb([value, value, value]))
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn test_generate_id_is_well_formed() {
        let id = generate_id("Jane Doe / Studio");
        assert!(id.starts_with("jane_doe___studio_"));
        validate_identifier("avatar id", &id).unwrap();
        assert!(generate_id("!!!").starts_with("avatar_"));
    }

    #[test]
    fn test_import_load_list_delete() {
        let src = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let store = AvatarStore::new(root.path());
        let frames = vec![write_png(src.path(), "a.PNG", 10), write_png(src.path(), "b.png", 20)];

        let avatar = store
            .import("Presenter", &frames, Some(FaceRegion::new(2, 2, 8, 8)))
            .unwrap();
        assert_eq!(avatar.reference_frames[1], PathBuf::from("frames/frame_0001.png"));
        assert_eq!(store.load(&avatar.id).unwrap(), avatar);
        assert_eq!(store.list().unwrap().len(), 1);

        assert_eq!(store.reference_frame(&avatar.id, 1).unwrap().get_pixel(0, 0)[0], 20);
        // Out of range falls back to frame 0
        assert_eq!(store.reference_frame(&avatar.id, 99).unwrap().get_pixel(0, 0)[0], 10);

        store.delete(&avatar.id).unwrap();
        assert!(store.load(&avatar.id).unwrap_err().is_not_found());
        assert!(store.delete(&avatar.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_import_rejects_bad_frames() {
        let src = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let store = AvatarStore::new(root.path());
        let bogus = src.path().join("bogus.png");
        std::fs::write(&bogus, b"not an image").unwrap();

        assert!(matches!(store.import("x", &[bogus], None), Err(PipelineError::Validation(_))));
        assert!(matches!(store.import("x", &[], None), Err(PipelineError::Validation(_))));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_update_metadata_merges() {
        let src = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let store = AvatarStore::new(root.path());
        let avatar = store.import("Host", &[write_png(src.path(), "f.png", 0)], None).unwrap();

        let mut updates = serde_json::Map::new();
        updates.insert("language".into(), serde_json::json!("en"));
        let updated = store.update_metadata(&avatar.id, updates).unwrap();
        assert_eq!(updated.metadata["language"], "en");
        assert!(updated.updated_at.is_some());
        assert_eq!(store.load(&avatar.id).unwrap().metadata.len(), 1);
    }

    #[tokio::test]
    async fn test_import_video_samples_frames() {
        let root = tempfile::tempdir().unwrap();
        let store = AvatarStore::new(root.path());
        let backend = MemoryBackend::new();
        let video = root.path().join("source.mp4");
        let frames: Vec<RgbImage> = (0..30u8)
            .map(|v| RgbImage::from_pixel(16, 12, image::Rgb([v, v, v])))
            .collect();
        backend.insert_video(&video, 25.0, frames);

        let avatar = store
            .import_video(&backend, "Speaker", &video, 10, Some(FaceRegion::new(2, 2, 8, 8)))
            .await
            .unwrap();
        assert_eq!(avatar.reference_frames.len(), 10);
        assert_eq!(avatar.metadata["source_video"], video.display().to_string());
        // step = 30 / 10 = 3
        assert_eq!(store.reference_frame(&avatar.id, 1).unwrap().get_pixel(0, 0)[0], 3);
        assert_eq!(store.reference_frame(&avatar.id, 9).unwrap().get_pixel(0, 0)[0], 27);
    }

    #[tokio::test]
    async fn test_short_video_keeps_every_frame() {
        let root = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let video = root.path().join("short.mp4");
        backend.insert_video(&video, 25.0, vec![RgbImage::new(8, 8); 4]);

        assert_eq!(sample_video_frames(&backend, &video, 300).await.unwrap().len(), 4);
        let store = AvatarStore::new(root.path().join("avatars"));
        let missing = root.path().join("missing.mp4");
        assert!(store.import_video(&backend, "x", &missing, 10, None).await.is_err());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_traversal_ids_rejected() {
        let root = tempfile::tempdir().unwrap();
        let store = AvatarStore::new(root.path());
        assert!(matches!(store.load("../etc"), Err(PipelineError::Validation(_))));
        assert!(!store.exists("../etc"));
    }
}
