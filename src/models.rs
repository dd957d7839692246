use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::lenient;

/// The two kinds of artifact the server can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

// --- Requests ---

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub app_id: String,
    pub device_model: String,
    pub os: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub app_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub command_id: i64,
    pub app_id: String,
    pub status: String,
    pub message: String,
    pub timestamp: i64,
}

// --- Command polling ---

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCommand {
    #[serde(deserialize_with = "lenient::i64_or_zero")]
    pub id: i64,
    #[serde(rename = "type", default, deserialize_with = "lenient::string_or_empty")]
    pub command_type: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandsResponse {
    #[serde(default)]
    pub commands: Vec<DeviceCommand>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub last_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub status: Option<String>,
}

// --- Media status polling ---

/// A media item exactly as it appears in one slot of the status payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    #[serde(default, deserialize_with = "lenient::i64_or_zero")]
    pub id: i64,
    #[serde(default, deserialize_with = "lenient::string_or_empty")]
    pub filename: String,
    #[serde(default, deserialize_with = "lenient::string_or_empty")]
    pub original_name: String,
    #[serde(default, deserialize_with = "lenient::string_or_empty")]
    pub url: String,
    #[serde(
        default,
        alias = "size",
        alias = "fileSize",
        deserialize_with = "lenient::u64_or_zero"
    )]
    pub size_bytes: u64,
    #[serde(default, alias = "mimetype", deserialize_with = "lenient::string_or_empty")]
    pub mime_type: String,
    #[serde(default, alias = "is_active", deserialize_with = "lenient::opt_bool")]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaSlots {
    #[serde(default)]
    pub image: Option<MediaItem>,
    #[serde(default)]
    pub video: Option<MediaItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStatusResponse {
    #[serde(default, deserialize_with = "lenient::opt_bool")]
    pub success: Option<bool>,
    #[serde(default)]
    pub media: Option<MediaSlots>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub media_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub user_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub device_id: Option<String>,
}

impl MediaStatusResponse {
    /// Descriptor for the image slot, if the server actually asserts one.
    pub fn image(&self) -> Option<MediaDescriptor> {
        self.media
            .as_ref()
            .and_then(|m| m.image.as_ref())
            .and_then(|item| MediaDescriptor::from_item(MediaKind::Image, item))
    }

    /// Descriptor for the video slot, if the server actually asserts one.
    pub fn video(&self) -> Option<MediaDescriptor> {
        self.media
            .as_ref()
            .and_then(|m| m.video.as_ref())
            .and_then(|item| MediaDescriptor::from_item(MediaKind::Video, item))
    }
}

/// One media artifact the server wants on screen. Immutable for the poll
/// cycle it was read in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescriptor {
    pub id: i64,
    pub kind: MediaKind,
    pub filename: String,
    pub original_name: String,
    pub url: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub is_active: Option<bool>,
}

impl MediaDescriptor {
    /// Returns `None` for placeholder slots: non-positive id or no url.
    pub fn from_item(kind: MediaKind, item: &MediaItem) -> Option<Self> {
        if item.id <= 0 || item.url.trim().is_empty() {
            return None;
        }
        let filename = if item.filename.is_empty() {
            item.url
                .rsplit('/')
                .next()
                .and_then(|s| s.split('?').next())
                .unwrap_or_default()
                .to_string()
        } else {
            item.filename.clone()
        };
        Some(Self {
            id: item.id,
            kind,
            original_name: if item.original_name.is_empty() {
                filename.clone()
            } else {
                item.original_name.clone()
            },
            filename,
            url: item.url.trim().to_string(),
            size_bytes: item.size_bytes,
            mime_type: item.mime_type.clone(),
            is_active: item.is_active,
        })
    }
}
