//! CLI argument construction for both pipeline phases.
//!
//! The external tools are opaque: all we rely on is the argument contract
//! and the exit code. Scene preparation is expected to write a render scene
//! named `<stem>_render.<ext>` next to the input scene.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::pipeline::PipelineSpec;

/// Suffix the preparation tool appends to the scene stem when writing the
/// render scene.
const RENDER_SCENE_SUFFIX: &str = "_render";

/// Scene preparation:
/// `<prep> <scene> <render_dir> <engine> <ignore_hidden> <delete_hidden> <use_scene_settings>`
pub fn build_prep_command(spec: &PipelineSpec) -> Command {
    let mut cmd = Command::new(&spec.scene_prep_cmd);
    cmd.arg(&spec.scene_file)
        .arg(&spec.render_dir)
        .arg(&spec.engine)
        .arg(&spec.ignore_hidden)
        .arg(&spec.delete_hidden)
        .arg(&spec.use_scene_settings)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Batch render:
/// `<render> -rd <render_dir> -x <res_x> -y <res_y> -of <format> <render_scene>`
///
/// When the job renders with the scene's own settings the resolution is
/// passed as `0 0`, telling the tool to keep what the scene specifies.
pub fn build_render_command(spec: &PipelineSpec, render_scene: &Path) -> Command {
    let (res_x, res_y) = if spec.use_scene_settings == "1" {
        (0, 0)
    } else {
        (spec.res_x, spec.res_y)
    };

    let mut cmd = Command::new(&spec.render_cmd);
    cmd.arg("-rd")
        .arg(&spec.render_dir)
        .arg("-x")
        .arg(res_x.to_string())
        .arg("-y")
        .arg(res_y.to_string())
        .arg("-of")
        .arg(&spec.output_format)
        .arg(render_scene)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Path of the render scene the preparation phase produces.
pub fn render_scene_path(scene_file: &Path) -> PathBuf {
    let stem = scene_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match scene_file.extension() {
        Some(ext) => format!("{stem}{RENDER_SCENE_SUFFIX}.{}", ext.to_string_lossy()),
        None => format!("{stem}{RENDER_SCENE_SUFFIX}"),
    };
    scene_file.with_file_name(name)
}
