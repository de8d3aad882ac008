//! Scene-file staging.
//!
//! Remote clients submit scene files on shares that can disappear or slow
//! down mid-render, so the file is copied into the local staging directory
//! before the job queues. Staging failure is not fatal: the job falls back
//! to rendering from the submitted path.

use std::path::{Path, PathBuf};

use layersmith_core::paths::staged_scene_path;

/// Copy `scene` into `staging_dir`, returning the staged path.
pub async fn stage_scene_file(scene: &Path, staging_dir: &Path) -> Option<PathBuf> {
    if let Err(e) = tokio::fs::create_dir_all(staging_dir).await {
        tracing::warn!(dir = %staging_dir.display(), error = %e, "Cannot create staging directory");
        return None;
    }

    let target = staged_scene_path(staging_dir, scene);
    match tokio::fs::copy(scene, &target).await {
        Ok(bytes) => {
            tracing::info!(
                scene = %scene.display(),
                target = %target.display(),
                bytes,
                "Scene file staged"
            );
            Some(target)
        }
        Err(e) => {
            tracing::warn!(scene = %scene.display(), error = %e, "Scene staging failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stages_scene_into_directory() {
        let source = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let scene = source.path().join("seats.mb");
        tokio::fs::write(&scene, b"scene-bytes").await.unwrap();

        let staged = stage_scene_file(&scene, staging.path()).await.unwrap();
        assert_eq!(staged, staging.path().join("seats.mb"));
        assert_eq!(tokio::fs::read(&staged).await.unwrap(), b"scene-bytes");
    }

    #[tokio::test]
    async fn missing_scene_reports_failure() {
        let staging = tempfile::tempdir().unwrap();
        let staged = stage_scene_file(Path::new("/nonexistent/seats.mb"), staging.path()).await;
        assert!(staged.is_none());
    }
}
