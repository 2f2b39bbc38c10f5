//! Directory listing for the widget: audio files of one folder, with probed tags.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, StandardTagKey};
use symphonia::core::probe::Hint;
use widget_engine::track::{Track, TrackTags};
use widget_engine::traversal::ContainerListing;

const AUDIO_EXTENSIONS: &[&str] = &[
    "flac", "mp3", "m4a", "aac", "alac", "wav", "aif", "aiff", "ogg", "oga", "opus", "webm", "mp4",
];

const ARTWORK_NAMES: &[&str] = &["cover", "folder", "front", "album"];
const ARTWORK_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Where track sources point: the local file or the same path on a media server.
#[derive(Clone, Debug)]
pub struct SourceMapper {
    root: PathBuf,
    remote_base: Option<String>,
}

impl SourceMapper {
    pub fn new(root: PathBuf, remote_base: Option<String>) -> Self {
        Self { root, remote_base }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_for(&self, path: &Path) -> String {
        let Some(base) = self.remote_base.as_deref() else {
            return path.to_string_lossy().to_string();
        };
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let encoded: Vec<String> = relative
            .components()
            .map(|c| urlencoding::encode(&c.as_os_str().to_string_lossy()).into_owned())
            .collect();
        format!("{base}/{}", encoded.join("/"))
    }
}

pub fn is_audio_extension(ext: &str) -> bool {
    AUDIO_EXTENSIONS.contains(&ext)
}

fn lowercase_extension(path: &Path) -> String {
    path.extension()
        .and_then(OsStr::to_str)
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn sort_key(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Audio files of `dir` in case-insensitive name order.
pub fn list_container(dir: &Path, mapper: &SourceMapper) -> Result<ContainerListing> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read_dir {:?}", dir))? {
        let entry = entry.context("read_dir entry")?;
        let path = entry.path();
        if path.is_file() && is_audio_extension(&lowercase_extension(&path)) {
            files.push(path);
        }
    }
    files.sort_by_key(|p| sort_key(p));

    let artwork = find_artwork(dir).map(|p| mapper.source_for(&p));
    let tracks = files
        .iter()
        .map(|path| {
            let (mut tags, duration) = probe_tags(path);
            tags.artwork = artwork.clone();
            Track::new(mapper.source_for(path))
                .with_tags(tags)
                .with_duration(duration)
        })
        .collect();

    tracing::debug!(dir = %dir.display(), tracks = files.len(), "listed container");
    Ok(ContainerListing {
        container: dir.to_string_lossy().to_string(),
        tracks,
    })
}

/// Subdirectories of `dir` in case-insensitive name order, hidden ones skipped.
pub fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read_dir {:?}", dir))? {
        let entry = entry.context("read_dir entry")?;
        let path = entry.path();
        let hidden = path
            .file_name()
            .and_then(OsStr::to_str)
            .is_some_and(|n| n.starts_with('.'));
        if path.is_dir() && !hidden {
            dirs.push(path);
        }
    }
    dirs.sort_by_key(|p| sort_key(p));
    Ok(dirs)
}

fn find_artwork(dir: &Path) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            let stem = p
                .file_stem()
                .and_then(OsStr::to_str)
                .unwrap_or("")
                .to_ascii_lowercase();
            ARTWORK_NAMES.contains(&stem.as_str()) && ARTWORK_EXTENSIONS.contains(&lowercase_extension(p).as_str())
        })
        .collect();
    candidates.sort_by_key(|p| {
        let stem = p.file_stem().and_then(OsStr::to_str).unwrap_or("").to_ascii_lowercase();
        ARTWORK_NAMES.iter().position(|n| *n == stem).unwrap_or(usize::MAX)
    });
    candidates.into_iter().next()
}

/// Display tags and duration; unreadable files yield empty tags.
fn probe_tags(path: &Path) -> (TrackTags, Option<Duration>) {
    let mut tags = TrackTags::default();
    let ext = lowercase_extension(path);
    let file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return (tags, None),
    };
    let mut hint = Hint::new();
    if !ext.is_empty() {
        hint.with_extension(&ext);
    }
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut probed = match symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    ) {
        Ok(probed) => probed,
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "tag probe failed");
            return (tags, None);
        }
    };

    let duration = probed.format.default_track().and_then(|track| {
        let params = &track.codec_params;
        match (params.n_frames, params.sample_rate) {
            (Some(frames), Some(rate)) if rate > 0 => {
                Some(Duration::from_millis(frames.saturating_mul(1000) / u64::from(rate)))
            }
            _ => None,
        }
    });

    let mut apply = |rev: &symphonia::core::meta::MetadataRevision| {
        for tag in rev.tags() {
            let slot = match tag.std_key {
                Some(StandardTagKey::TrackTitle) => &mut tags.title,
                Some(StandardTagKey::Artist) => &mut tags.artist,
                Some(StandardTagKey::Album) => &mut tags.album,
                _ => continue,
            };
            let value = tag.value.to_string();
            if slot.is_none() && !value.trim().is_empty() {
                *slot = Some(value.trim().to_string());
            }
        }
    };
    if let Some(rev) = probed.format.metadata().current() {
        apply(rev);
    }
    if let Some(rev) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
        apply(rev);
    }
    (tags, duration)
}
