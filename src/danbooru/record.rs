//! Normalization of post payloads into [`PostRecord`].
//!
//! The API returns several shapes for the same endpoint depending on the post and on who is asking:
//! fully visible posts, banned or gold-exclusive posts whose file fields are stripped for the caller,
//! posts whose stored hash does not match the file, deleted posts that are still served, and posts
//! with dead external sources. All of them end up as one record type. Fields the upstream withholds
//! are kept apart from fields that simply have no value, see [`Field`].

use std::collections::BTreeSet;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// General tags that put a post behind the Gold tier.
const GOLD_EXCLUSIVE_TAGS: [&str; 3] = ["loli", "shota", "toddlercon"];

/// Meta tag set when the stored md5 does not match the file.
const MD5_MISMATCH_TAG: &str = "md5_mismatch";

/// Meta tags marking a source that no longer resolves.
const DEAD_SOURCE_TAGS: [&str; 2] = ["bad_id", "bad_link"];

/// A value that is either there, missing from the data, or hidden from the caller by upstream policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field<T> {
    Present(T),
    /// The data model has no value for this post.
    Absent,
    /// A value exists but the upstream did not hand it out.
    Withheld,
}

impl<T> Field<T> {
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(value) => Field::Present(value),
            None => Field::Absent,
        }
    }

    pub fn is_withheld(&self) -> bool {
        matches!(self, Field::Withheld)
    }
}

/// Which rendition of a post the caller wants saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageSize {
    /// The original file.
    #[default]
    Large,
    /// The resized rendition. Identical to the original for small images.
    Small,
}

/// One anomaly a record may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Anomaly {
    Banned,
    Deleted,
    HashUnverifiable,
    GoldExclusive,
    LowResolutionVariant,
    DeadSource,
}

impl Anomaly {
    /// Anomalies that make the record degraded rather than a plain success.
    pub fn degrades(&self) -> bool {
        matches!(
            self,
            Anomaly::Banned | Anomaly::Deleted | Anomaly::HashUnverifiable | Anomaly::GoldExclusive
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Anomaly::Banned => "banned",
            Anomaly::Deleted => "deleted",
            Anomaly::HashUnverifiable => "hash_unverifiable",
            Anomaly::GoldExclusive => "gold_exclusive",
            Anomaly::LowResolutionVariant => "low_resolution_variant",
            Anomaly::DeadSource => "dead_source",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnomalyFlags {
    pub is_banned: bool,
    pub is_deleted: bool,
    pub hash_unverifiable: bool,
    pub gold_exclusive: bool,
    pub low_resolution_variant: bool,
    pub dead_source: bool,
}

impl AnomalyFlags {
    /// Every flag that is set, in a fixed order.
    pub fn triggered(&self) -> Vec<Anomaly> {
        [
            (self.is_banned, Anomaly::Banned),
            (self.is_deleted, Anomaly::Deleted),
            (self.hash_unverifiable, Anomaly::HashUnverifiable),
            (self.gold_exclusive, Anomaly::GoldExclusive),
            (self.low_resolution_variant, Anomaly::LowResolutionVariant),
            (self.dead_source, Anomaly::DeadSource),
        ]
        .into_iter()
        .filter_map(|(set, anomaly)| set.then_some(anomaly))
        .collect()
    }
}

/// The normalized post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRecord {
    pub id: Field<u64>,
    pub source: Option<String>,
    pub pixiv_id: Option<u64>,
    pub artists: BTreeSet<String>,
    pub characters: BTreeSet<String>,
    pub copyrights: BTreeSet<String>,
    pub general: BTreeSet<String>,
    pub md5: Field<String>,
    pub file_url: Field<String>,
    pub large_file_url: Field<String>,
    pub preview_file_url: Option<String>,
    pub file_ext: Option<String>,
    pub rating: Option<String>,
    pub created_at: Option<DateTime<FixedOffset>>,
    pub flags: AnomalyFlags,
}

impl PostRecord {
    /// Anomalies that turn the outcome into a degraded one.
    pub fn degrading_anomalies(&self) -> Vec<Anomaly> {
        self.flags
            .triggered()
            .into_iter()
            .filter(Anomaly::degrades)
            .collect()
    }

    /// Whether the upstream withheld any of the gated fields.
    pub fn is_gated(&self) -> bool {
        self.id.is_withheld() || self.file_url.is_withheld()
    }

    pub fn file_url_for(&self, size: ImageSize) -> &Field<String> {
        match size {
            ImageSize::Large => &self.file_url,
            ImageSize::Small => &self.large_file_url,
        }
    }

    /// Where the file can still be obtained by hand, when the upstream will not serve it.
    pub fn manual_download_url(&self) -> Option<String> {
        if self.flags.dead_source {
            return None;
        }
        match self.pixiv_id {
            Some(pixiv_id) => Some(format!("https://www.pixiv.net/en/artworks/{}", pixiv_id)),
            None => self.source.clone(),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Post payload is not an object")]
    NotAnObject,

    #[error("Required field missing: {0}")]
    MissingField(&'static str),

    #[error("Post payload has an unexpected shape: {0}")]
    Shape(String),
}

/// Raw post payload. Every field is optional here; requirements are enforced in [`normalize`].
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct PostEntry {
    id: Option<u64>,
    source: Option<String>,
    pixiv_id: Option<u64>,
    md5: Option<String>,
    file_url: Option<String>,
    large_file_url: Option<String>,
    preview_file_url: Option<String>,
    file_ext: Option<String>,
    rating: Option<String>,
    created_at: Option<String>,
    tag_string: Option<String>,
    tag_string_general: Option<String>,
    tag_string_artist: Option<String>,
    tag_string_character: Option<String>,
    tag_string_copyright: Option<String>,
    tag_string_meta: Option<String>,
    is_banned: Option<bool>,
    is_deleted: Option<bool>,
}

fn tag_set(tags: Option<&str>) -> BTreeSet<String> {
    tags.map(|tags| tags.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

/// Builds a [`PostRecord`] from a successful post payload.
///
/// Missing optional fields never fail; only the tag string, present in every known shape, is required.
pub fn normalize(body: &Value) -> Result<PostRecord, NormalizeError> {
    if !body.is_object() {
        return Err(NormalizeError::NotAnObject);
    }
    let entry = PostEntry::deserialize(body).map_err(|e| NormalizeError::Shape(e.to_string()))?;

    let tag_string = entry
        .tag_string
        .as_deref()
        .ok_or(NormalizeError::MissingField("tag_string"))?;

    let artists = tag_set(entry.tag_string_artist.as_deref());
    let characters = tag_set(entry.tag_string_character.as_deref());
    let copyrights = tag_set(entry.tag_string_copyright.as_deref());
    let meta = tag_set(entry.tag_string_meta.as_deref());
    let general = match entry.tag_string_general.as_deref() {
        Some(general) => tag_set(Some(general)),
        None => tag_set(Some(tag_string))
            .into_iter()
            .filter(|tag| {
                !artists.contains(tag)
                    && !characters.contains(tag)
                    && !copyrights.contains(tag)
                    && !meta.contains(tag)
            })
            .collect(),
    };

    let is_banned = entry.is_banned.unwrap_or(false);
    let gold_exclusive = GOLD_EXCLUSIVE_TAGS.iter().any(|tag| general.contains(*tag));
    let gated_fields_missing = entry.id.is_none()
        && entry.md5.is_none()
        && entry.file_url.is_none()
        && entry.large_file_url.is_none();

    let (id, md5, file_url, large_file_url) = if gated_fields_missing && (is_banned || gold_exclusive) {
        (Field::Withheld, Field::Withheld, Field::Withheld, Field::Withheld)
    } else {
        (
            Field::from_option(entry.id),
            Field::from_option(non_empty(entry.md5)),
            Field::from_option(non_empty(entry.file_url)),
            Field::from_option(non_empty(entry.large_file_url)),
        )
    };
    let preview_file_url = non_empty(entry.preview_file_url);

    let low_resolution_variant = match (&file_url, &large_file_url) {
        (Field::Present(full), Field::Present(large)) => {
            full == large && preview_file_url.as_deref() != Some(full.as_str())
        }
        _ => false,
    };
    // Only meaningful when a hash exists, withheld or not.
    let hash_unverifiable = meta.contains(MD5_MISMATCH_TAG) && !matches!(md5, Field::Absent);
    let dead_source = DEAD_SOURCE_TAGS.iter().any(|tag| meta.contains(*tag));

    let created_at = entry
        .created_at
        .as_deref()
        .and_then(|created_at| DateTime::parse_from_rfc3339(created_at).ok());

    Ok(PostRecord {
        id,
        source: non_empty(entry.source),
        pixiv_id: entry.pixiv_id,
        artists,
        characters,
        copyrights,
        general,
        md5,
        file_url,
        large_file_url,
        preview_file_url,
        file_ext: non_empty(entry.file_ext),
        rating: non_empty(entry.rating),
        created_at,
        flags: AnomalyFlags {
            is_banned,
            is_deleted: entry.is_deleted.unwrap_or(false),
            hash_unverifiable,
            gold_exclusive,
            low_resolution_variant,
            dead_source,
        },
    })
}
