//! Local media handling before upload to a backend.
//!
//! Values flowing between nodes reference media as `{"type": "image" |
//! "video", "path": ...}` (Input nodes) or as `{"images": [...]}` (outputs of
//! an upstream Workflow node). Before a workflow is submitted each referenced
//! file is prepared locally: a `mask` image is embedded into the target
//! image's alpha channel, images are cropped and videos trimmed per the node
//! config. The prepared files are then uploaded by the dispatcher.

use std::path::{Path, PathBuf};

use image::{imageops, DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::PipelineError;

pub const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];
pub const VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "webm", "mov", "mkv", "gif"];

/// Parameter name of a mask to embed into the primary image.
pub const MASK_PARAM: &str = "mask";

/// Preferred parameter receiving the embedded mask.
const PRIMARY_IMAGE_PARAM: &str = "image";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Video)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

/// A local media file referenced by a port value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub path: PathBuf,
}

impl MediaRef {
    pub fn to_value(&self) -> Value {
        json!({"type": self.kind.as_str(), "path": self.path.to_string_lossy()})
    }
}

/// Recognise a media reference in a port value.
pub fn media_ref(value: &Value) -> Option<MediaRef> {
    let obj = value.as_object()?;
    if let (Some(kind), Some(path)) = (
        obj.get("type").and_then(Value::as_str),
        obj.get("path").and_then(Value::as_str),
    ) {
        let kind = match kind {
            "image" => MediaKind::Image,
            "video" => MediaKind::Video,
            _ => return None,
        };
        return Some(MediaRef {
            kind,
            path: PathBuf::from(path),
        });
    }
    let first = obj
        .get("images")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(Value::as_str)?;
    let path = PathBuf::from(first);
    Some(MediaRef {
        kind: MediaKind::from_path(&path).unwrap_or(MediaKind::Image),
        path,
    })
}

/// Check an Input node's configured file.
pub fn validate_input_file(file_path: Option<&str>) -> Result<MediaRef, PipelineError> {
    let raw = file_path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| PipelineError::Media("Input node has no file_path".to_string()))?;
    let path = PathBuf::from(raw);
    let meta = std::fs::metadata(&path)
        .map_err(|_| PipelineError::Media(format!("Input file does not exist: {raw}")))?;
    if !meta.is_file() {
        return Err(PipelineError::Media(format!("Input path is not a file: {raw}")));
    }
    let kind = MediaKind::from_path(&path)
        .ok_or_else(|| PipelineError::Media(format!("Unsupported media type: {raw}")))?;
    Ok(MediaRef { kind, path })
}

// ---------------------------------------------------------------------------
// Node config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct TrimRange {
    /// Start offset in seconds.
    #[serde(default)]
    pub start: f64,
    /// Length in seconds; to the end when absent.
    pub duration: Option<f64>,
}

fn config_entry<T: for<'de> Deserialize<'de>>(
    config: &Map<String, Value>,
    key: &str,
) -> Result<Option<T>, PipelineError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| PipelineError::Media(format!("Invalid {key} config: {e}"))),
    }
}

// ---------------------------------------------------------------------------
// Preparation
// ---------------------------------------------------------------------------

/// A parameter whose value must be replaced by an uploaded file reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedUpload {
    pub param: String,
    pub path: PathBuf,
}

/// Prepare every media parameter for upload, writing derived files to
/// `work_dir`. The mask parameter is consumed when it could be embedded.
pub async fn prepare_uploads(
    params: &mut Map<String, Value>,
    node_config: &Map<String, Value>,
    work_dir: &Path,
) -> Result<Vec<PreparedUpload>, PipelineError> {
    let crop: Option<CropRect> = config_entry(node_config, "crop")?;
    let trim: Option<TrimRange> = config_entry(node_config, "trim")?;

    let mut media: Vec<(String, MediaRef)> = params
        .iter()
        .filter_map(|(k, v)| media_ref(v).map(|m| (k.clone(), m)))
        .collect();
    if media.is_empty() {
        return Ok(Vec::new());
    }
    tokio::fs::create_dir_all(work_dir).await?;

    let mask_idx = media
        .iter()
        .position(|(k, m)| k == MASK_PARAM && m.kind == MediaKind::Image);
    if let Some(idx) = mask_idx {
        let primary = media
            .iter()
            .position(|(k, m)| k == PRIMARY_IMAGE_PARAM && m.kind == MediaKind::Image)
            .or_else(|| {
                media
                    .iter()
                    .position(|(k, m)| k != MASK_PARAM && m.kind == MediaKind::Image)
            });
        if let Some(primary) = primary {
            let (_, mask) = media[idx].clone();
            let (param, image) = (&media[primary].0, media[primary].1.path.clone());
            let out = derived_path(work_dir, param, &image, "masked", "png");
            embed_mask(&image, &mask.path, &out).await?;
            media[primary].1.path = out;
            media.remove(idx);
            params.remove(MASK_PARAM);
        }
    }

    let mut uploads = Vec::with_capacity(media.len());
    for (param, item) in media {
        let path = match (item.kind, crop, trim) {
            (MediaKind::Image, Some(rect), _) => {
                let out = derived_path(work_dir, &param, &item.path, "crop", "png");
                crop_image(&item.path, rect, &out).await?;
                out
            }
            (MediaKind::Video, _, Some(range)) => {
                let ext = item
                    .path
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("mp4")
                    .to_string();
                let out = derived_path(work_dir, &param, &item.path, "trim", &ext);
                trim_video(&item.path, range, &out).await?;
                out
            }
            _ => item.path,
        };
        uploads.push(PreparedUpload { param, path });
    }
    Ok(uploads)
}

/// `<param>_<stem>_<suffix>.<ext>` in `work_dir`. The parameter name keeps
/// files of different parameters apart when their sources share a stem.
fn derived_path(work_dir: &Path, param: &str, source: &Path, suffix: &str, ext: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("media");
    let param: String = param
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    work_dir.join(format!("{param}_{stem}_{suffix}.{ext}"))
}

// ---------------------------------------------------------------------------
// Image operations
// ---------------------------------------------------------------------------

fn open_image(path: &Path) -> Result<DynamicImage, PipelineError> {
    image::open(path)
        .map_err(|e| PipelineError::Media(format!("Cannot decode {}: {e}", path.display())))
}

fn save_png(image: &DynamicImage, out: &Path) -> Result<(), PipelineError> {
    image
        .save_with_format(out, ImageFormat::Png)
        .map_err(|e| PipelineError::Media(format!("Cannot write {}: {e}", out.display())))
}

async fn blocking<F>(op: F) -> Result<(), PipelineError>
where
    F: FnOnce() -> Result<(), PipelineError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| PipelineError::Media(format!("Media task failed: {e}")))?
}

/// Write `image` with `mask` in its alpha channel. White mask pixels become
/// transparent, which the worker's image loader reads back as the mask.
pub async fn embed_mask(image: &Path, mask: &Path, out: &Path) -> Result<(), PipelineError> {
    let (image, mask, out) = (image.to_path_buf(), mask.to_path_buf(), out.to_path_buf());
    blocking(move || {
        let mut rgba = open_image(&image)?.to_rgba8();
        let mut luma = open_image(&mask)?.to_luma8();
        if luma.dimensions() != rgba.dimensions() {
            luma = imageops::resize(
                &luma,
                rgba.width(),
                rgba.height(),
                imageops::FilterType::Triangle,
            );
        }
        for (px, m) in rgba.pixels_mut().zip(luma.pixels()) {
            px.0[3] = 255 - m.0[0];
        }
        save_png(&DynamicImage::ImageRgba8(rgba), &out)
    })
    .await
}

pub async fn crop_image(source: &Path, rect: CropRect, out: &Path) -> Result<(), PipelineError> {
    let (source, out) = (source.to_path_buf(), out.to_path_buf());
    blocking(move || {
        let img = open_image(&source)?;
        let fits = rect.width > 0
            && rect.height > 0
            && rect.x.checked_add(rect.width).is_some_and(|r| r <= img.width())
            && rect.y.checked_add(rect.height).is_some_and(|b| b <= img.height());
        if !fits {
            return Err(PipelineError::Media(format!(
                "Crop {}x{}+{}+{} exceeds image {}x{}",
                rect.width,
                rect.height,
                rect.x,
                rect.y,
                img.width(),
                img.height()
            )));
        }
        save_png(&img.crop_imm(rect.x, rect.y, rect.width, rect.height), &out)
    })
    .await
}

// ---------------------------------------------------------------------------
// Video operations
// ---------------------------------------------------------------------------

/// Cut `range` out of `source` with ffmpeg, copying streams.
pub async fn trim_video(source: &Path, range: TrimRange, out: &Path) -> Result<(), PipelineError> {
    if range.start < 0.0 || range.duration.is_some_and(|d| d <= 0.0) {
        return Err(PipelineError::Media(format!(
            "Invalid trim range: start {} duration {:?}",
            range.start, range.duration
        )));
    }
    let mut cmd = tokio::process::Command::new("ffmpeg");
    cmd.arg("-y")
        .arg("-v")
        .arg("error")
        .arg("-ss")
        .arg(format!("{:.3}", range.start))
        .arg("-i")
        .arg(source);
    if let Some(duration) = range.duration {
        cmd.arg("-t").arg(format!("{duration:.3}"));
    }
    cmd.arg("-c").arg("copy").arg(out);

    let output = cmd.output().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PipelineError::Media(format!("ffmpeg binary not found: {e}"))
        } else {
            PipelineError::Io(e)
        }
    })?;
    if !output.status.success() {
        return Err(PipelineError::Media(format!(
            "ffmpeg failed (exit code {:?}): {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
