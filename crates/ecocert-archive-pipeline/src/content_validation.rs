//! Pre-flight checks run before content is handed to the pinning service.

use std::sync::OnceLock;

use regex_lite::Regex;

use crate::error::PinError;
use crate::mime;

/// Extensions accepted for pinning
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "pdf", "png", "jpg", "jpeg", "gif", "webp", "svg", "tif", "tiff", "html", "htm", "txt", "md",
    "csv", "json", "geojson", "kml", "xml", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "mp4",
    "webm", "mp3", "wav", "zip",
];

/// MIME types accepted for pinning when the allowlist is enforced
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/webp",
    "image/svg+xml",
    "image/tiff",
    "text/html",
    "text/plain",
    "text/markdown",
    "text/csv",
    "application/json",
    "application/geo+json",
    "application/vnd.google-earth.kml+xml",
    "application/xml",
    "text/xml",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "video/mp4",
    "video/webm",
    "audio/mpeg",
    "audio/wav",
    "application/zip",
];

const SUSPICIOUS_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)<script", "embedded <script> tag"),
    (r"(?i)javascript:", "javascript: URI"),
    (r"(?i)eval\s*\(", "eval() call"),
    (r"(?i)document\.write", "document.write call"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationPolicy {
    pub max_size: u64,
    pub enforce_mime_allowlist: bool,
    pub block_suspicious_content: bool,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            max_size: 100 * 1024 * 1024,
            enforce_mime_allowlist: true,
            block_suspicious_content: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub mime_type: String,
    pub extension: Option<String>,
    pub warnings: Vec<String>,
}

fn suspicious_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        SUSPICIOUS_PATTERNS
            .iter()
            .filter_map(|(pattern, label)| {
                let regex = Regex::new(pattern).ok()?;
                Some((regex, *label))
            })
            .collect()
    })
}

/// Labels of every suspicious pattern found in `content`.
#[must_use]
pub fn scan_suspicious(content: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(content);
    suspicious_patterns()
        .iter()
        .filter(|(regex, _)| regex.is_match(&text))
        .map(|(_, label)| (*label).to_string())
        .collect()
}

/// Validate `content` destined for `filename`.
///
/// `content_type` is the type reported by the fetcher; without one the type
/// is looked up from the file extension.
///
/// # Errors
/// Returns `EMPTY_CONTENT`, `FILE_TOO_LARGE`, `UNSUPPORTED_FILE_TYPE`,
/// `UNSUPPORTED_MIME_TYPE` or, when blocking is enabled, `SUSPICIOUS_CONTENT`.
pub fn validate_content(
    content: &[u8],
    filename: &str,
    content_type: Option<&str>,
    policy: &ValidationPolicy,
) -> Result<ValidationReport, PinError> {
    if content.is_empty() {
        return Err(PinError::EmptyContent);
    }
    let size = content.len() as u64;
    if size > policy.max_size {
        return Err(PinError::FileTooLarge {
            size,
            max: policy.max_size,
        });
    }

    let extension = mime::extension_of(filename);
    match extension.as_deref() {
        Some(ext) if ALLOWED_EXTENSIONS.contains(&ext) => {}
        Some(ext) => return Err(PinError::UnsupportedFileType(ext.to_string())),
        None => {
            return Err(PinError::UnsupportedFileType(format!(
                "{filename} (no extension)"
            )))
        }
    }

    let from_extension = extension.as_deref().and_then(mime::mime_for_extension);
    let mime_type = content_type
        .and_then(mime::normalize_content_type)
        .or_else(|| from_extension.map(str::to_string))
        .unwrap_or_else(|| mime::OCTET_STREAM.to_string());
    if policy.enforce_mime_allowlist && !ALLOWED_MIME_TYPES.contains(&mime_type.as_str()) {
        return Err(PinError::UnsupportedMimeType(mime_type));
    }

    let warnings = scan_suspicious(content);
    if !warnings.is_empty() {
        if policy.block_suspicious_content {
            return Err(PinError::SuspiciousContent(warnings));
        }
        tracing::warn!(filename, patterns = ?warnings, "suspicious patterns in content");
    }

    Ok(ValidationReport {
        mime_type,
        extension,
        warnings,
    })
}
