//! Content type and file extension helpers.

use url::Url;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Known extensions and their canonical MIME type; first match wins when
/// mapping a MIME type back to an extension.
const EXTENSIONS: &[(&str, &str)] = &[
    ("pdf", "application/pdf"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("csv", "text/csv"),
    ("json", "application/json"),
    ("geojson", "application/geo+json"),
    ("kml", "application/vnd.google-earth.kml+xml"),
    ("xml", "application/xml"),
    ("doc", "application/msword"),
    ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ("xls", "application/vnd.ms-excel"),
    ("xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
    ("ppt", "application/vnd.ms-powerpoint"),
    ("pptx", "application/vnd.openxmlformats-officedocument.presentationml.presentation"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("zip", "application/zip"),
];

/// Strip parameters and lowercase a `Content-Type` header value.
#[must_use]
pub fn normalize_content_type(header: &str) -> Option<String> {
    let essence = header
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    (!essence.is_empty()).then_some(essence)
}

#[must_use]
pub fn mime_for_extension(extension: &str) -> Option<&'static str> {
    let extension = extension.to_ascii_lowercase();
    EXTENSIONS
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, mime)| *mime)
}

#[must_use]
pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    EXTENSIONS
        .iter()
        .find(|(_, known)| *known == mime)
        .map(|(ext, _)| *ext)
}

/// Extension of a file name (`report.PDF` -> `pdf`), if it looks like one.
#[must_use]
pub fn extension_of(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    let valid = !stem.is_empty()
        && (1..=8).contains(&ext.len())
        && ext.bytes().all(|b| b.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

/// Last non-empty path segment of `url`, percent-encoding left intact.
#[must_use]
pub fn last_path_segment(url: &Url) -> Option<String> {
    url.path_segments()?
        .rev()
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

#[must_use]
pub fn extension_from_url(url: &Url) -> Option<String> {
    last_path_segment(url).as_deref().and_then(extension_of)
}

/// Content type for a download: the response header when present, else a
/// lookup by URL suffix, else `application/octet-stream`.
#[must_use]
pub fn resolve_content_type(header: Option<&str>, url: &Url) -> String {
    let from_suffix = || extension_from_url(url).and_then(|ext| mime_for_extension(&ext));
    header
        .and_then(normalize_content_type)
        .or_else(|| from_suffix().map(str::to_string))
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

/// Extension for a download: the URL path when it has one, else derived
/// from the content type.
#[must_use]
pub fn resolve_extension(url: &Url, content_type: &str) -> Option<String> {
    extension_from_url(url).or_else(|| extension_for_mime(content_type).map(str::to_string))
}

/// File name used when pinning content fetched from `url`.
#[must_use]
pub fn upload_filename(url: &Url, extension: Option<&str>) -> String {
    let segment = last_path_segment(url)
        .map(|segment| {
            segment
                .chars()
                .filter(|c| !matches!(c, '/' | '\\' | '"'))
                .collect::<String>()
        })
        .filter(|segment| !segment.is_empty())
        .unwrap_or_else(|| "content".to_string());

    match extension {
        Some(ext) if extension_of(&segment).as_deref() != Some(ext) => format!("{segment}.{ext}"),
        _ => segment,
    }
}
