//! Object keys for user images.
//!
//! Originals live under `originals/<scope>/<upload_id>/<file_name>`. The key
//! of the annotated copy is derived from the original by swapping the fixed
//! leading segment for `annotated/`, so the two key spaces never meet and
//! every original maps to exactly one annotated key.

use uuid::Uuid;

pub const ORIGINALS_PREFIX: &str = "originals";
pub const ANNOTATED_PREFIX: &str = "annotated";

/// Key of a user's original upload. Only constructible through [`OriginalKey::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginalKey {
    key: String,
}

/// Key of the engine's annotated rendering of an original.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnnotatedKey {
    key: String,
}

impl OriginalKey {
    /// `scope` groups uploads (the chat the image came from), `upload_id` is
    /// fresh per upload so equal file names never share a key.
    pub fn new(scope: &str, upload_id: Uuid, file_name: &str) -> Self {
        Self {
            key: format!(
                "{ORIGINALS_PREFIX}/{}/{upload_id}/{}",
                sanitize_segment(scope),
                sanitize_segment(file_name)
            ),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Last segment, the name the engine saves its copy under.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    pub fn annotated(&self) -> AnnotatedKey {
        let tail = &self.key[ORIGINALS_PREFIX.len()..];
        AnnotatedKey {
            key: format!("{ANNOTATED_PREFIX}{tail}"),
        }
    }
}

impl AnnotatedKey {
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for OriginalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

impl std::fmt::Display for AnnotatedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

/// Keep a single path segment to `[A-Za-z0-9._-]`, never empty, never `.`/`..`.
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
