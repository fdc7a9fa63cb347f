//! Notification shapes sent from the Board Session / Line Inspector to the
//! Control Gateway (spec §6). Grounded in the original agent's
//! `websocket.go` `notify()`, which builds one JSON object per event kind
//! through a big switch; here the switch becomes [`Notification::to_json`]
//! over a closed Rust enum instead of untyped `map[string]interface{}`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::inspector::Event;

/// Board info parsed from `dofile("/_info.lua")` (spec §3 "Board info").
/// Written exactly once per successful boot; read-only afterward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoardInfo {
    pub build: String,
    pub commit: String,
    pub board: String,
    #[serde(default)]
    pub subtype: String,
    pub brand: String,
    #[serde(default)]
    pub ota: bool,
    #[serde(default, rename = "shell")]
    pub shell_enabled: bool,
}

impl BoardInfo {
    /// `brand-model[-subtype]`, computed once and cached on the session.
    pub fn firmware_name(&self) -> String {
        if self.subtype.is_empty() {
            format!("{}-{}", self.brand, self.board)
        } else {
            format!("{}-{}-{}", self.brand, self.board, self.subtype)
        }
    }
}

/// Closed set of messages the agent pushes to the IDE over the control
/// channel, unprompted by any single command (spec §6).
#[derive(Debug, Clone)]
pub enum Notification {
    BoardAttached { info: BoardInfo, new_build: bool },
    BoardDetached,
    BoardPowerOnReset,
    BoardSoftwareReset,
    BoardDeepSleepReset,
    BoardRuntimeError {
        location: String,
        line: String,
        exception: String,
        message_b64: String,
    },
    BoardRuntimeWarning {
        location: String,
        line: String,
        exception: String,
        message_b64: String,
    },
    BlockStart { block_b64: String },
    BlockEnd { block_b64: String },
    BlockError { block_b64: String, error_b64: String },
    BlockErrorCatched { block_b64: String },
    BoardUpdate { what: String },
    BoardReset,
    InvalidFirmware,
    InvalidPrerequisites,
    AttachIde { agent_version: String },
    BoardUpgraded,
    BoardGetDirContent { path: String, entries: Value },
    BoardReadFile { content_b64: String },
    BoardWriteFile { path: String },
    BoardRunProgram { path: String },
    BoardRunCommand { response_b64: String },
    ScanningBoards { candidates: usize },
    NoBoardAttached,
}

impl Notification {
    pub fn to_json(&self) -> Value {
        match self {
            Notification::BoardAttached { info, new_build } => json!({
                "command": "boardAttached",
                "info": info,
                "newBuild": new_build,
            }),
            Notification::BoardDetached => json!({ "command": "boardDetached" }),
            Notification::BoardPowerOnReset => json!({ "command": "boardPowerOnReset" }),
            Notification::BoardSoftwareReset => json!({ "command": "boardSoftwareReset" }),
            Notification::BoardDeepSleepReset => json!({ "command": "boardDeepSleepReset" }),
            Notification::BoardRuntimeError {
                location,
                line,
                exception,
                message_b64,
            } => json!({
                "command": "boardRuntimeError",
                "where": location,
                "line": line,
                "exception": exception,
                "message": message_b64,
            }),
            Notification::BoardRuntimeWarning {
                location,
                line,
                exception,
                message_b64,
            } => json!({
                "command": "boardRuntimeWarning",
                "where": location,
                "line": line,
                "exception": exception,
                "message": message_b64,
            }),
            Notification::BlockStart { block_b64 } => json!({
                "command": "blockStart",
                "block": block_b64,
            }),
            Notification::BlockEnd { block_b64 } => json!({
                "command": "blockEnd",
                "block": block_b64,
            }),
            Notification::BlockError {
                block_b64,
                error_b64,
            } => json!({
                "command": "blockError",
                "block": block_b64,
                "error": error_b64,
            }),
            Notification::BlockErrorCatched { block_b64 } => json!({
                "command": "blockErrorCatched",
                "block": block_b64,
            }),
            Notification::BoardUpdate { what } => json!({
                "command": "boardUpdate",
                "what": what,
            }),
            Notification::BoardReset => json!({ "command": "boardReset" }),
            Notification::InvalidFirmware => json!({ "command": "invalidFirmware" }),
            Notification::InvalidPrerequisites => json!({ "command": "invalidPrerequisites" }),
            Notification::AttachIde { agent_version } => json!({
                "command": "attachIde",
                "agent-version": agent_version,
            }),
            Notification::BoardUpgraded => json!({ "command": "boardUpgraded" }),
            Notification::BoardGetDirContent { path, entries } => json!({
                "command": "boardGetDirContent",
                "path": path,
                "entries": entries,
            }),
            Notification::BoardReadFile { content_b64 } => json!({
                "command": "boardReadFile",
                "content": content_b64,
            }),
            Notification::BoardWriteFile { path } => json!({
                "command": "boardWriteFile",
                "path": path,
            }),
            Notification::BoardRunProgram { path } => json!({
                "command": "boardRunProgram",
                "path": path,
            }),
            Notification::BoardRunCommand { response_b64 } => json!({
                "command": "boardRunCommand",
                "response": response_b64,
            }),
            Notification::ScanningBoards { candidates } => json!({
                "command": "scanningBoards",
                "candidates": candidates,
            }),
            Notification::NoBoardAttached => json!({ "command": "noBoardAttached" }),
        }
    }
}

/// Translates a Line Inspector [`Event`] into the notification the Control
/// Gateway forwards to the IDE. `Plain`, `Prompt`, `FallbackInterpreter`,
/// `FlashReadError` and `BootingBanner` drive the boot state machine only
/// and have no IDE-visible counterpart.
pub fn event_to_notification(event: &Event) -> Option<Notification> {
    match event {
        Event::PowerOnReset => Some(Notification::BoardPowerOnReset),
        Event::SoftwareReset => Some(Notification::BoardSoftwareReset),
        Event::DeepSleepReset => Some(Notification::BoardDeepSleepReset),
        Event::BlockStart { block } => Some(Notification::BlockStart {
            block_b64: block.clone(),
        }),
        Event::BlockEnd { block } => Some(Notification::BlockEnd {
            block_b64: block.clone(),
        }),
        Event::BlockError { block, error } => Some(Notification::BlockError {
            block_b64: block.clone(),
            error_b64: error.clone(),
        }),
        Event::BlockErrorCatched { block } => Some(Notification::BlockErrorCatched {
            block_b64: block.clone(),
        }),
        Event::RuntimeError {
            location,
            line,
            exception,
            message,
        } => Some(Notification::BoardRuntimeError {
            location: location.clone(),
            line: line.clone(),
            exception: exception.clone(),
            message_b64: message.clone(),
        }),
        Event::RuntimeWarning {
            location,
            line,
            exception,
            message,
        } => Some(Notification::BoardRuntimeWarning {
            location: location.clone(),
            line: line.clone(),
            exception: exception.clone(),
            message_b64: message.clone(),
        }),
        Event::InvalidFirmware => Some(Notification::InvalidFirmware),
        _ => None,
    }
}

/// Implemented by whatever owns the IDE connection; the Board Session and
/// Port Monitor only know they can push a [`Notification`] somewhere.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Sink that drops everything, used where no gateway is attached yet (e.g.
/// construction, tests that don't care about notifications).
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _notification: Notification) {}
}

/// Forwards to whichever sink is currently registered, or drops the
/// notification if none is. The Board Session is built once at startup
/// and can outlive any number of IDE connections, so it's handed a
/// `SinkRouter` instead of a connection-specific sink directly; the
/// Control Gateway swaps the active sink in and out as connections come
/// and go.
#[derive(Default)]
pub struct SinkRouter {
    active: std::sync::Mutex<Option<Arc<dyn NotificationSink>>>,
}

impl SinkRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, sink: Option<Arc<dyn NotificationSink>>) {
        *self.active.lock().unwrap() = sink;
    }
}

impl NotificationSink for SinkRouter {
    fn notify(&self, notification: Notification) {
        if let Some(sink) = self.active.lock().unwrap().as_ref() {
            sink.notify(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firmware_name_without_subtype() {
        let info = BoardInfo {
            build: "1".into(),
            commit: "abc".into(),
            board: "esp32".into(),
            subtype: String::new(),
            brand: "whitecat".into(),
            ota: false,
            shell_enabled: true,
        };
        assert_eq!(info.firmware_name(), "whitecat-esp32");
    }

    #[test]
    fn firmware_name_with_subtype() {
        let info = BoardInfo {
            build: "1".into(),
            commit: "abc".into(),
            board: "esp32".into(),
            subtype: "core".into(),
            brand: "whitecat".into(),
            ota: false,
            shell_enabled: true,
        };
        assert_eq!(info.firmware_name(), "whitecat-esp32-core");
    }

    #[test]
    fn board_runtime_error_serializes_with_where_key() {
        let n = Notification::BoardRuntimeError {
            location: "main".into(),
            line: "12".into(),
            exception: "5".into(),
            message_b64: "bmlsIGluZGV4aW5n".into(),
        };
        let v = n.to_json();
        assert_eq!(v["where"], "main");
        assert_eq!(v["command"], "boardRuntimeError");
    }
}
