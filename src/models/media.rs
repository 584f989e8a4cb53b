//! MIME allow-lists and payload checks applied before any upload.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::error::{Error, Result};
use crate::models::types::BinaryPayload;

pub const IMAGE_MIME_TYPES: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

pub const AUDIO_MIME_TYPES: &[&str] = &[
    "audio/mpeg",
    "audio/mp4",
    "audio/wav",
    "audio/webm",
    "audio/ogg",
    "audio/flac",
];

pub const VIDEO_MIME_TYPES: &[&str] = &["video/mp4"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
    Video,
}

impl MediaKind {
    pub fn allowed(&self) -> &'static [&'static str] {
        match self {
            MediaKind::Image => IMAGE_MIME_TYPES,
            MediaKind::Audio => AUDIO_MIME_TYPES,
            MediaKind::Video => VIDEO_MIME_TYPES,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Lowercased MIME type without parameters (`audio/ogg; codecs=opus` → `audio/ogg`).
pub fn normalize_mime(mime_type: &str) -> String {
    let essence = mime_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    match essence.as_str() {
        "image/jpg" => "image/jpeg".to_string(),
        "audio/mp3" => "audio/mpeg".to_string(),
        "audio/x-wav" | "audio/wave" => "audio/wav".to_string(),
        _ => essence,
    }
}

pub fn validate_mime(kind: MediaKind, mime_type: &str) -> Result<String> {
    let normalized = normalize_mime(mime_type);
    if kind.allowed().contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        Err(Error::invalid_request(format!(
            "Unsupported {} type '{}' (allowed: {})",
            kind.label(),
            mime_type,
            kind.allowed().join(", ")
        )))
    }
}

/// Rejects empty payloads and types outside the allow-list.
pub fn validate_payload(kind: MediaKind, payload: &BinaryPayload) -> Result<()> {
    if payload.data.is_empty() {
        return Err(Error::invalid_request(format!("Empty {} payload", kind.label())));
    }
    validate_mime(kind, &payload.mime_type).map(|_| ())
}

pub fn decode_base64(provider: &str, data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data.trim())
        .map_err(|e| Error::backend(provider, format!("Invalid base64 in response: {}", e)))
}

/// File extension used for multipart uploads.
pub fn file_extension(mime_type: &str) -> &'static str {
    match normalize_mime(mime_type).as_str() {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "audio/mpeg" => "mp3",
        "audio/mp4" => "m4a",
        "audio/wav" => "wav",
        "audio/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/flac" => "flac",
        "video/mp4" => "mp4",
        _ => "bin",
    }
}

/// MIME type for a text-to-speech output format.
pub fn speech_mime(format: &str) -> &'static str {
    match format {
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "opus" => "audio/ogg",
        "aac" => "audio/mp4",
        "pcm" => "audio/pcm",
        _ => "audio/mpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_lists() {
        assert_eq!(validate_mime(MediaKind::Image, "image/JPG").unwrap(), "image/jpeg");
        assert_eq!(validate_mime(MediaKind::Audio, "audio/ogg; codecs=opus").unwrap(), "audio/ogg");
        assert!(validate_mime(MediaKind::Video, "video/mp4").is_ok());

        let err = validate_mime(MediaKind::Image, "image/tiff").unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(ref msg) if msg.contains("image/tiff")));
        assert!(validate_mime(MediaKind::Video, "video/quicktime").is_err());
    }

    #[test]
    fn test_empty_payload_rejected() {
        let payload = BinaryPayload::new("image/png", Vec::new());
        assert!(matches!(validate_payload(MediaKind::Image, &payload), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_decode_reports_provider() {
        assert_eq!(decode_base64("gemini", "AQI=").unwrap(), vec![1, 2]);
        match decode_base64("gemini", "not base64!") {
            Err(Error::Backend { provider, .. }) => assert_eq!(provider, "gemini"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_extensions() {
        assert_eq!(file_extension("audio/mp3"), "mp3");
        assert_eq!(speech_mime("wav"), "audio/wav");
        assert_eq!(speech_mime("mp3"), "audio/mpeg");
    }
}
