//! Artifact Store
//!
//! Generated text documents and images, grouped per session. A session's
//! [`ArtifactSet`] is assembled by the orchestrator during the run and inserted into the
//! [`ArtifactStore`] exactly once; after that it is shared read-only behind an `Arc`.

use crate::document::Document;
use crate::image::{ImageOutcome, ImageStyle, extension_for_mime};
use crate::session::SessionId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Text,
    Image,
}

/// Where an image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    Generated,
    Searched,
}

impl ImageSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageSource::Generated => "generated",
            ImageSource::Searched => "searched",
        }
    }
}

/// An image attached to a session, either with its bytes or as a bare URL reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageArtifact {
    pub ordinal: u32,
    pub source: ImageSource,
    pub mime_type: Option<String>,
    pub source_url: Option<String>,
    pub prompt: Option<String>,
    pub style: Option<ImageStyle>,
    #[serde(skip)]
    pub bytes: Option<Vec<u8>>,
}

impl ImageArtifact {
    /// Builds an unnumbered artifact from a successful generation; the ordinal is
    /// assigned when it is pushed into an [`ArtifactSet`].
    pub fn generated(outcome: ImageOutcome) -> Self {
        Self {
            ordinal: 0,
            source: ImageSource::Generated,
            mime_type: outcome.mime_type,
            source_url: outcome.url,
            prompt: Some(outcome.prompt),
            style: Some(outcome.style),
            bytes: outcome.bytes,
        }
    }

    pub fn searched(url: impl Into<String>) -> Self {
        Self {
            ordinal: 0,
            source: ImageSource::Searched,
            mime_type: None,
            source_url: Some(url.into()),
            prompt: None,
            style: None,
            bytes: None,
        }
    }

    pub fn extension(&self) -> &'static str {
        self.mime_type.as_deref().map_or("jpg", extension_for_mime)
    }

    /// e.g. `image_001_generated.jpg`
    pub fn file_name(&self) -> String {
        format!(
            "image_{:03}_{}.{}",
            self.ordinal,
            self.source.as_str(),
            self.extension()
        )
    }

    /// Path of the image inside exported archives.
    pub fn archive_path(&self) -> String {
        format!("images/{}", self.file_name())
    }

    pub fn has_bytes(&self) -> bool {
        self.bytes.as_ref().is_some_and(|b| !b.is_empty())
    }
}

/// Lightweight description of one artifact, as listed in a session's index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub name: String,
    pub kind: ArtifactKind,
    pub size_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ImageSource>,
    /// False for extra text files outside the seven required documents.
    pub canonical: bool,
}

/// Canonical name → handle, for both text documents and images.
pub type ArtifactIndex = BTreeMap<String, ArtifactHandle>;

/// All artifacts produced by one generation run.
///
/// Text documents are keyed by file name and kept in lexical order. Images keep their
/// insertion order and are numbered from 1; the ordinal is what clients use to fetch them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactSet {
    texts: BTreeMap<String, String>,
    images: Vec<ImageArtifact>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or wholesale-replaces a text document.
    pub fn insert_text(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.texts.insert(name.into(), content.into());
    }

    /// Appends an image and returns the 1-based ordinal it was given.
    pub fn push_image(&mut self, mut image: ImageArtifact) -> u32 {
        let ordinal = self.images.len() as u32 + 1;
        image.ordinal = ordinal;
        self.images.push(image);
        ordinal
    }

    pub fn texts(&self) -> &BTreeMap<String, String> {
        &self.texts
    }

    /// Content of one text document, if present.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.texts.get(name).map(String::as_str)
    }

    pub fn images(&self) -> &[ImageArtifact] {
        &self.images
    }

    /// Looks an image up by its 1-based ordinal.
    pub fn image(&self, ordinal: u32) -> Option<&ImageArtifact> {
        self.images.iter().find(|img| img.ordinal == ordinal)
    }

    /// Text documents that are not among the seven canonical ones, in lexical order.
    pub fn extras(&self) -> impl Iterator<Item = (&String, &String)> {
        self.texts
            .iter()
            .filter(|(name, _)| Document::from_file_name(name).is_none())
    }

    /// Builds the name → handle index stored on the completed session.
    pub fn index(&self) -> ArtifactIndex {
        let texts = self.texts.iter().map(|(name, content)| {
            (
                name.clone(),
                ArtifactHandle {
                    name: name.clone(),
                    kind: ArtifactKind::Text,
                    size_bytes: content.len(),
                    ordinal: None,
                    source: None,
                    canonical: Document::from_file_name(name).is_some(),
                },
            )
        });
        let images = self.images.iter().map(|img| {
            (
                img.file_name(),
                ArtifactHandle {
                    name: img.file_name(),
                    kind: ArtifactKind::Image,
                    size_bytes: img.bytes.as_ref().map_or(0, Vec::len),
                    ordinal: Some(img.ordinal),
                    source: Some(img.source),
                    canonical: true,
                },
            )
        });
        texts.chain(images).collect()
    }
}

/// Session id → artifacts, safe for concurrent insertion across sessions.
#[derive(Default)]
pub struct ArtifactStore {
    sets: DashMap<SessionId, Arc<ArtifactSet>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_id: SessionId, set: ArtifactSet) -> Arc<ArtifactSet> {
        let set = Arc::new(set);
        self.sets.insert(session_id, set.clone());
        set
    }

    pub fn get(&self, session_id: SessionId) -> Option<Arc<ArtifactSet>> {
        self.sets.get(&session_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, session_id: SessionId) -> Option<Arc<ArtifactSet>> {
        self.sets.remove(&session_id).map(|(_, set)| set)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}
