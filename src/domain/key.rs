//! Content keys: the `(content id, format)` pair every tier is addressed by.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Media format requested for a piece of content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    /// Audio-only rendition
    Audio,

    /// Full video rendition
    Video,
}

impl Format {
    /// Stable lowercase name, used in storage and on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Audio => "audio",
            Format::Video => "video",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "audio" | "mp3" | "m4a" => Ok(Format::Audio),
            "video" | "mp4" => Ok(Format::Video),
            _ => anyhow::bail!("Unknown format: {}", s),
        }
    }
}

/// Lookup key shared by the cache, store, archive and origin tiers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentKey {
    content_id: String,
    format: Format,
}

impl ContentKey {
    /// Create a key. The id is trimmed; validation is separate (see [`ContentKey::validate`]).
    pub fn new(content_id: impl Into<String>, format: Format) -> Self {
        let content_id: String = content_id.into();
        Self {
            content_id: content_id.trim().to_string(),
            format,
        }
    }

    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Check that the id is something an origin could plausibly address.
    ///
    /// Ids are opaque to this crate, but they end up as subprocess
    /// arguments and archive captions, so only URL-safe characters are
    /// accepted and a leading `-` is rejected.
    pub fn validate(&self) -> Result<(), String> {
        if self.content_id.is_empty() {
            return Err("content id cannot be empty".to_string());
        }
        if self.content_id.len() > 128 {
            return Err(format!(
                "content id is too long ({} > 128 characters)",
                self.content_id.len()
            ));
        }
        if self.content_id.starts_with('-') {
            return Err("content id cannot start with '-'".to_string());
        }
        if let Some(c) = self
            .content_id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(format!("content id contains invalid character {:?}", c));
        }
        Ok(())
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.content_id, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!("audio".parse::<Format>().unwrap(), Format::Audio);
        assert_eq!("VIDEO".parse::<Format>().unwrap(), Format::Video);
        assert_eq!("mp3".parse::<Format>().unwrap(), Format::Audio);
        assert!("flac-ish".parse::<Format>().is_err());
    }

    #[test]
    fn test_key_display_and_trim() {
        let key = ContentKey::new("  dQw4w9WgXcQ ", Format::Audio);
        assert_eq!(key.content_id(), "dQw4w9WgXcQ");
        assert_eq!(key.to_string(), "dQw4w9WgXcQ/audio");
    }

    #[test]
    fn test_key_validation() {
        assert!(ContentKey::new("dQw4w9WgXcQ", Format::Video).validate().is_ok());
        assert!(ContentKey::new("", Format::Video).validate().is_err());
        assert!(ContentKey::new("--exec", Format::Video).validate().is_err());
        assert!(ContentKey::new("a b", Format::Video).validate().is_err());
        assert!(ContentKey::new("x".repeat(129), Format::Video).validate().is_err());
    }

    #[test]
    fn test_keys_differ_by_format() {
        let audio = ContentKey::new("K1", Format::Audio);
        let video = ContentKey::new("K1", Format::Video);
        assert_ne!(audio, video);
    }
}
