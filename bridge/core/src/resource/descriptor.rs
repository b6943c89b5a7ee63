//! Resource identifiers, kinds, and client-facing descriptors

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Server-issued resource reference id
///
/// Formatted `res-<process prefix>-<sequence>`; the sequence is monotonic so
/// an id is never handed out twice by one process.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rid(String);

impl Rid {
    pub(crate) fn allocate(prefix: &str, seq: u64) -> Self {
        Self(format!("res-{prefix}-{seq}"))
    }

    /// The id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Rid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Rid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Media kind of a resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Still image
    Image,
    /// Audio clip or voice recording
    Audio,
    /// Video clip
    Video,
    /// Anything else
    File,
}

impl ResourceKind {
    /// Parse a kind name as sent by clients
    ///
    /// `voice` and `record` are accepted as audio.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "image" | "img" | "picture" => Some(Self::Image),
            "audio" | "voice" | "record" => Some(Self::Audio),
            "video" => Some(Self::Video),
            "file" => Some(Self::File),
            _ => None,
        }
    }

    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::File => "file",
        }
    }

    /// MIME type assumed when none is given
    #[must_use]
    pub fn default_mime(self) -> &'static str {
        match self {
            Self::Image => "image/png",
            Self::Audio => "audio/mpeg",
            Self::Video => "video/mp4",
            Self::File => "application/octet-stream",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where registered content comes from
#[derive(Clone, Debug)]
pub enum ResourceSource {
    /// Bytes owned by the manager from now on
    Bytes(Vec<u8>),
    /// An existing file, referenced in place
    Path(PathBuf),
}

/// Whether a resource's content is available yet
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Reserved by `res.prepare`, waiting for its upload to be committed
    Pending,
    /// Content stored and retrievable
    #[default]
    Ready,
}

impl ResourceStatus {
    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved view of a resource, as sent to clients
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// Resource id
    pub rid: Rid,
    /// Media kind
    pub kind: ResourceKind,
    /// MIME type
    pub mime: String,
    /// Size in bytes; the declared size while pending
    pub size: u64,
    /// Upload state
    pub status: ResourceStatus,
    /// Hex SHA-256 of the content
    pub sha256: String,
    /// Retrieval URL on the resource byte server
    pub url: String,
    /// `data:` URI for small in-memory content
    pub inline: Option<String>,
    /// Registration time in epoch milliseconds
    pub created_at: i64,
}

impl ResourceDescriptor {
    /// JSON form used in packet payloads
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut value = json!({
            "rid": self.rid.as_str(),
            "kind": self.kind.as_str(),
            "mime": self.mime,
            "size": self.size,
            "status": self.status.as_str(),
            "sha256": self.sha256,
            "url": self.url,
            "createdAt": self.created_at,
        });
        if let (Some(inline), Some(object)) = (&self.inline, value.as_object_mut()) {
            object.insert("inline".into(), Value::String(inline.clone()));
        }
        value
    }
}
