//! Output and staging path construction.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CoreError;

/// Subdirectory created below the client's output directory; the unique
/// per-run directory is nested inside it.
pub const OUTPUT_DIR_NAME: &str = "render_output";

/// Prefix used when the scene file has no usable name.
const UNTITLED_PREFIX: &str = "untitled";

/// Replace anything outside `[A-Za-z0-9_.-]` with an underscore.
pub fn file_safe_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Create a collision-avoided render directory below `base_dir`.
///
/// The directory name derives from the scene file's stem (first eight
/// characters) and a timestamp token; if that name is already taken a
/// numeric suffix is appended until a fresh directory can be created.
pub fn unique_render_path(scene_file: Option<&Path>, base_dir: &Path) -> Result<PathBuf, CoreError> {
    let prefix: String = scene_file
        .and_then(Path::file_stem)
        .map(|stem| file_safe_name(&stem.to_string_lossy()))
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| UNTITLED_PREFIX.to_string())
        .chars()
        .take(8)
        .collect();

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| CoreError::Internal(e.to_string()))?
        .as_millis();

    let parent = base_dir.join(OUTPUT_DIR_NAME);
    let mut candidate = parent.join(format!("{prefix}_{millis}"));
    let mut attempt = 0u32;
    while candidate.exists() {
        attempt += 1;
        candidate = parent.join(format!("{prefix}_{millis}_{attempt}"));
    }

    std::fs::create_dir_all(&candidate)?;
    Ok(candidate)
}

/// Where a submitted scene file is staged locally.
pub fn staged_scene_path(staging_dir: &Path, scene_file: &Path) -> PathBuf {
    let name = scene_file
        .file_name()
        .map(|n| file_safe_name(&n.to_string_lossy()))
        .unwrap_or_else(|| UNTITLED_PREFIX.to_string());
    staging_dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_name_replaces_special_characters() {
        assert_eq!(file_safe_name("a b/c:d.mb"), "a_b_c_d.mb");
    }

    #[test]
    fn safe_name_keeps_allowed_characters() {
        assert_eq!(file_safe_name("seat-01_v2.mb"), "seat-01_v2.mb");
    }

    #[test]
    fn render_path_nests_under_output_dir_name() {
        let base = tempfile::tempdir().unwrap();
        let path = unique_render_path(Some(Path::new("/scenes/seats.mb")), base.path()).unwrap();
        assert!(path.starts_with(base.path().join(OUTPUT_DIR_NAME)));
        assert!(path.is_dir());
    }

    #[test]
    fn render_path_prefix_comes_from_scene_stem() {
        let base = tempfile::tempdir().unwrap();
        let path =
            unique_render_path(Some(Path::new("/scenes/long_scene_name.mb")), base.path()).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("long_sce"), "unexpected name {name}");
    }

    #[test]
    fn render_paths_do_not_collide() {
        let base = tempfile::tempdir().unwrap();
        let scene = Path::new("/scenes/seats.mb");
        let first = unique_render_path(Some(scene), base.path()).unwrap();
        let second = unique_render_path(Some(scene), base.path()).unwrap();
        assert_ne!(first, second);
        assert!(second.is_dir());
    }

    #[test]
    fn missing_scene_falls_back_to_untitled() {
        let base = tempfile::tempdir().unwrap();
        let path = unique_render_path(None, base.path()).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(UNTITLED_PREFIX));
    }

    #[test]
    fn staged_path_joins_sanitized_file_name() {
        let staged = staged_scene_path(Path::new("/staging"), Path::new("/remote/my scene.mb"));
        assert_eq!(staged, PathBuf::from("/staging/my_scene.mb"));
    }
}
