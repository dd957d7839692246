use crate::models::DeviceCommand;

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

// Commands the server can queue for this device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Ping,
    RefreshMedia,
    ClearCache,
    Status,
    Unknown(String),
}

impl CommandKind {
    pub fn from_type(command_type: &str) -> Self {
        match command_type.trim().to_ascii_lowercase().as_str() {
            "ping" => CommandKind::Ping,
            "refresh_media" | "refreshmedia" | "refresh" => CommandKind::RefreshMedia,
            "clear_cache" | "clearcache" => CommandKind::ClearCache,
            "status" => CommandKind::Status,
            _ => CommandKind::Unknown(command_type.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CommandKind::Ping => "ping",
            CommandKind::RefreshMedia => "refresh_media",
            CommandKind::ClearCache => "clear_cache",
            CommandKind::Status => "status",
            CommandKind::Unknown(raw) => raw.as_str(),
        }
    }
}

impl From<&DeviceCommand> for CommandKind {
    fn from(command: &DeviceCommand) -> Self {
        CommandKind::from_type(&command.command_type)
    }
}

/// What gets reported back to the server for one processed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: &'static str,
    pub message: String,
}

impl CommandOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_SUCCESS,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}
