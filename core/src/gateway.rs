//! Control Gateway (spec §4.7). Accepts WebSocket connections from the
//! browser IDE, dispatches framed JSON commands to the Board Session, and
//! relays notifications — plus an out-of-band console byte stream — back
//! over the same socket. Grounded in the original agent's `websocket.go`
//! (`handler`/`notify`), reshaped around `tungstenite`'s synchronous API
//! since nothing else in the retrieved pack uses an async runtime: one
//! thread per IDE connection, polling the socket with a short read
//! timeout so outbound notifications and console bytes can be flushed
//! between inbound reads.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use tungstenite::{Message, WebSocket};

use crate::context::AgentContext;
use crate::notification::{Notification, NotificationSink};

const POLL_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Deserialize)]
struct IncomingCommand {
    command: String,
    #[serde(default)]
    arguments: Value,
}

struct ChannelSink {
    tx: mpsc::Sender<Value>,
}

impl NotificationSink for ChannelSink {
    fn notify(&self, notification: Notification) {
        let _ = self.tx.send(notification.to_json());
    }
}

/// Binds `ctx.config.bind_address` and serves IDE connections until
/// `stop` is set. One thread per accepted connection.
pub fn serve(ctx: Arc<AgentContext>, stop: Arc<AtomicBool>) -> io::Result<()> {
    let listener = TcpListener::bind(&ctx.config.bind_address)?;
    listener.set_nonblocking(true)?;
    info!(address = %ctx.config.bind_address, "control gateway listening");

    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, addr)) => {
                info!(peer = %addr, "ide connected");
                let ctx = ctx.clone();
                thread::spawn(move || serve_connection(ctx, stream));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(POLL_TIMEOUT);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
    Ok(())
}

fn serve_connection(ctx: Arc<AgentContext>, stream: TcpStream) {
    if stream.set_read_timeout(Some(POLL_TIMEOUT)).is_err() {
        return;
    }
    let mut socket: WebSocket<TcpStream> = match tungstenite::accept(stream) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "websocket handshake failed");
            return;
        }
    };

    let (tx, rx) = mpsc::channel();
    ctx.notification_router.set(Some(Arc::new(ChannelSink { tx })));

    loop {
        while let Ok(value) = rx.try_recv() {
            if socket.send(Message::Text(value.to_string())).is_err() {
                ctx.notification_router.set(None);
                return;
            }
        }

        let console_bytes = ctx.session.console_channel().wait(Duration::from_millis(1));
        if !console_bytes.is_empty() && socket.send(Message::Binary(console_bytes)).is_err() {
            ctx.notification_router.set(None);
            return;
        }

        match socket.read() {
            Ok(Message::Text(text)) => {
                if let Err(e) = dispatch(&ctx, &text) {
                    warn!(error = %e, "command dispatch failed");
                }
            }
            Ok(Message::Binary(bytes)) => {
                let _ = ctx.session.console_write(&bytes);
            }
            Ok(Message::Close(_)) => {
                ctx.notification_router.set(None);
                return;
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(_) => {
                ctx.notification_router.set(None);
                return;
            }
        }
    }
}

fn arg_str(args: &Value, key: &str) -> Result<String, String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing argument {key}"))
}

/// Dispatch table from spec §4.7. Decode failures and session errors are
/// logged by the caller and otherwise swallowed — per spec §7 a single
/// failing command must never tear down the IDE connection.
fn dispatch(ctx: &Arc<AgentContext>, text: &str) -> Result<(), String> {
    let incoming: IncomingCommand = serde_json::from_str(text).map_err(|e| e.to_string())?;

    match incoming.command.as_str() {
        "attachIde" => {
            if let Some(devices) = incoming.arguments.get("devices").and_then(Value::as_array) {
                let mut registry = ctx.registry.lock().unwrap();
                for device in devices {
                    let vid = device
                        .get("vendorId")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let pid = device
                        .get("productId")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let vendor = device
                        .get("vendor")
                        .and_then(Value::as_str)
                        .unwrap_or("ide")
                        .to_string();
                    registry.add_descriptor(vendor, vec![(vid.to_string(), pid.to_string())]);
                }
            }
            ctx.session.push_notification(Notification::AttachIde {
                agent_version: env!("CARGO_PKG_VERSION").to_string(),
            });
            if let Some(info) = ctx.session.info() {
                ctx.session.push_notification(Notification::BoardAttached {
                    info,
                    new_build: false,
                });
            }
            Ok(())
        }

        "detachIde" => {
            ctx.session.detach();
            Ok(())
        }

        "boardReset" | "boardStop" => {
            ctx.session.reset(false, None, None).map_err(|e| e.to_string())?;
            if let Some(info) = ctx.session.info() {
                ctx.session.push_notification(Notification::BoardAttached {
                    info,
                    new_build: false,
                });
            }
            Ok(())
        }

        "boardGetDirContent" => {
            let path = arg_str(&incoming.arguments, "path")?;
            let entries = ctx
                .session
                .get_dir_content(&path)
                .map_err(|e| e.to_string())?;
            ctx.session
                .push_notification(Notification::BoardGetDirContent { path, entries });
            Ok(())
        }

        "boardReadFile" => {
            let path = arg_str(&incoming.arguments, "path")?;
            let content = ctx.session.read_file(&path).map_err(|e| e.to_string())?;
            ctx.session.push_notification(Notification::BoardReadFile {
                content_b64: BASE64.encode(content),
            });
            Ok(())
        }

        "boardWriteFile" => {
            let path = arg_str(&incoming.arguments, "path")?;
            let content_b64 = arg_str(&incoming.arguments, "content")?;
            let bytes = BASE64.decode(content_b64).map_err(|e| e.to_string())?;
            ctx.session
                .write_file(&path, &bytes)
                .map_err(|e| e.to_string())?;
            ctx.session
                .push_notification(Notification::BoardWriteFile { path });
            Ok(())
        }

        "boardRunProgram" => {
            let path = arg_str(&incoming.arguments, "path")?;
            let code_b64 = arg_str(&incoming.arguments, "code")?;
            let code = BASE64.decode(code_b64).map_err(|e| e.to_string())?;
            ctx.session
                .run_program(&path, &code)
                .map_err(|e| e.to_string())?;
            ctx.session
                .push_notification(Notification::BoardRunProgram { path });
            Ok(())
        }

        "boardRunCommand" => {
            let code_b64 = arg_str(&incoming.arguments, "code")?;
            let code = BASE64.decode(code_b64).map_err(|e| e.to_string())?;
            ctx.session.run_code(&code).map_err(|e| e.to_string())?;
            let response = ctx
                .session
                .send_command("_code()")
                .map_err(|e| e.to_string())?;
            ctx.session.push_notification(Notification::BoardRunCommand {
                response_b64: BASE64.encode(response),
            });
            Ok(())
        }

        "boardUpgrade" => {
            let firmware = incoming
                .arguments
                .get("firmware")
                .and_then(Value::as_str)
                .map(str::to_string);
            if !ctx.begin_upgrade() {
                return Err("an upgrade is already in progress".to_string());
            }
            let result = match ctx.archive_fetcher.as_deref() {
                Some(fetcher) => ctx
                    .session
                    .upgrade(true, firmware.as_deref(), fetcher, ctx.archive_extractor.as_ref())
                    .map_err(|e| e.to_string()),
                None => Err("no archive fetcher configured".to_string()),
            };
            ctx.end_upgrade();
            result
        }

        other => {
            warn!(command = other, "unrecognized command");
            Ok(())
        }
    }
}
