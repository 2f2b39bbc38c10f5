use std::time::Duration;

pub use widget_types::TrackId;

/// Display tags read from the container.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    /// Cover art reference shared by the container.
    pub artwork: Option<String>,
}

/// A playable selection resolved by the directory collaborator.
#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    pub id: TrackId,
    /// Server path or local file path, without any transcode parameters.
    pub source: String,
    pub duration: Option<Duration>,
    pub tags: TrackTags,
}

impl Track {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            id: TrackId::from_path(&source),
            source,
            duration: None,
            tags: TrackTags::default(),
        }
    }

    pub fn with_tags(mut self, tags: TrackTags) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_duration(mut self, duration: Option<Duration>) -> Self {
        self.duration = duration;
        self
    }

    /// Lowercased file extension of the source path, ignoring any query string.
    pub fn extension(&self) -> Option<String> {
        let path = self.source.split('?').next().unwrap_or_default();
        let file = path.rsplit('/').next().unwrap_or(path);
        let (stem, ext) = file.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    /// Title tag, falling back to the file name without its extension.
    pub fn display_title(&self) -> String {
        if let Some(title) = self.tags.title.as_deref().filter(|t| !t.trim().is_empty()) {
            return title.to_string();
        }
        let path = self.source.split('?').next().unwrap_or_default();
        let file = path.rsplit('/').next().unwrap_or(path);
        match file.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => file.to_string(),
        }
    }
}
