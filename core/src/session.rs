//! Board Session (spec §4.4) — the core of the agent.
//!
//! Owns the attached board's serial port, demultiplexes its byte stream
//! between console output and synchronous command replies, drives the
//! boot-sequence state machine, and implements the chunked upload/download
//! framing. Every public operation here serializes on `inner`: at most one
//! is ever mid-flight, and `mode`/`read_timeout_ms` are always restored on
//! the way out, success or failure, per the propagation policy in spec §7.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::collaborators::{ArchiveExtractor, ArchiveFetcher, CommitIndex, PrerequisitesSource};
use crate::demux::{ConsoleChannel, Mode, ModeFlag, RxQueue};
use crate::error::{Result, SessionError};
use crate::inspector::{BOOT_SCRIPTS_ABORTED, Event, LineInspector, is_prompt};
use crate::notification::{BoardInfo, Notification, NotificationSink, event_to_notification};
use crate::registry::AdapterRegistry;
use crate::transport::{NativeTransport, PortInfo, SerialTransport};

/// Protocol-fixed; one length byte per chunk (spec §4.4).
const CHUNK_SIZE: usize = 255;
const DEFAULT_TIMEOUT_MS: u64 = 4_000;
const FORMATTING_TIMEOUT_MS: u64 = 120_000;
/// 115200 8-N-1 (spec §6). Reapplied alongside each RTS toggle during
/// reset, matching the original agent's `options.Apply`.
const BAUD_RATE: u32 = 115_200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootState {
    WaitBoot,
    WaitBanner,
    WaitPromptAborted,
    Ready,
}

fn strip_trailing_commas(s: &str) -> String {
    s.replace(",}", "}").replace(",]", "]")
}

/// Fields guarded by the session lock (spec §5 "shared-resource policy").
struct SessionInner {
    writer: Option<Box<dyn SerialTransport>>,
    /// The OS device path `writer` was opened against. `upgrade` reads
    /// this before detaching so it can still prefix `--port <dev>` to the
    /// flasher invocation.
    device_name: Option<String>,
    read_timeout_ms: Option<u64>,
    shell_enabled: bool,
    info: Option<BoardInfo>,
    valid_firmware: bool,
    valid_prerequisites: bool,
    is_ch340: bool,
}

impl Default for SessionInner {
    fn default() -> Self {
        Self {
            writer: None,
            device_name: None,
            read_timeout_ms: None,
            shell_enabled: false,
            info: None,
            valid_firmware: false,
            valid_prerequisites: false,
            is_ch340: false,
        }
    }
}

/// State and operations bound to one attached board (spec §3 "Session
/// state"). Exactly one instance is ever attached per process.
pub struct BoardSession {
    mode: ModeFlag,
    rx_queue: Arc<RxQueue>,
    console_channel: Arc<ConsoleChannel>,
    inspector: Arc<Mutex<LineInspector>>,
    boot_tx: Sender<Event>,
    boot_rx: Mutex<Receiver<Event>>,
    disable_boot_events: Arc<AtomicBool>,
    sink: Arc<dyn NotificationSink>,
    inner: Mutex<SessionInner>,
    reader_stop: Arc<AtomicBool>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    attached: AtomicBool,
}

impl BoardSession {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        let (boot_tx, boot_rx) = mpsc::channel();
        Self {
            mode: ModeFlag::default(),
            rx_queue: RxQueue::new(10 * 1024),
            console_channel: ConsoleChannel::new(4096),
            inspector: Arc::new(Mutex::new(LineInspector::new())),
            boot_tx,
            boot_rx: Mutex::new(boot_rx),
            disable_boot_events: Arc::new(AtomicBool::new(false)),
            sink,
            inner: Mutex::new(SessionInner::default()),
            reader_stop: Arc::new(AtomicBool::new(true)),
            reader_handle: Mutex::new(None),
            attached: AtomicBool::new(false),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub fn info(&self) -> Option<BoardInfo> {
        self.inner.lock().unwrap().info.clone()
    }

    /// The console-up stream the Control Gateway pumps to the IDE.
    pub fn console_channel(&self) -> Arc<ConsoleChannel> {
        self.console_channel.clone()
    }

    /// Liveness probe for the Port Monitor (spec §4.6): errors if the
    /// underlying device has been unplugged.
    pub fn probe_liveness(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        match &inner.writer {
            Some(w) => w.input_waiting().map(|_| ()).map_err(SessionError::from),
            None => Err(SessionError::NotAttached),
        }
    }

    pub fn notify_scanning(&self, candidates: usize) {
        self.sink.notify(Notification::ScanningBoards { candidates });
    }

    pub fn notify_no_board(&self) {
        self.sink.notify(Notification::NoBoardAttached);
    }

    /// Generic escape hatch for the Control Gateway's command-reply
    /// notifications (`boardGetDirContent`, `boardReadFile`, ...).
    pub fn push_notification(&self, notification: Notification) {
        self.sink.notify(notification);
    }

    /// The one sanctioned bypass of the session lock (spec §9 open
    /// questions): writes straight to the port while `mode = CONSOLE`,
    /// same as the original agent's `consoleDown`.
    pub fn console_write(&self, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let writer = inner.writer.as_mut().ok_or(SessionError::NotAttached)?;
        writer.write_all(bytes).map_err(SessionError::from)
    }

    // ---- attach / detach -------------------------------------------------

    pub fn attach(
        &self,
        port: &PortInfo,
        prereqs: Option<&dyn PrerequisitesSource>,
        commit_index: Option<&dyn CommitIndex>,
    ) -> Result<()> {
        let transport = NativeTransport::open(&port.device_name, BAUD_RATE, Duration::from_millis(50))?;
        self.attach_with_transport(
            Box::new(transport),
            Some(port.device_name.clone()),
            AdapterRegistry::is_ch340(port),
            prereqs,
            commit_index,
        )
    }

    /// Same as [`attach`](Self::attach) but takes an already-open
    /// transport, so tests can hand it a [`crate::transport::mock::MockTransport`].
    pub fn attach_with_transport(
        &self,
        transport: Box<dyn SerialTransport>,
        device_name: Option<String>,
        is_ch340: bool,
        prereqs: Option<&dyn PrerequisitesSource>,
        commit_index: Option<&dyn CommitIndex>,
    ) -> Result<()> {
        if self.attached.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let reader_transport = match transport.try_clone_box() {
            Ok(t) => t,
            Err(e) => {
                self.attached.store(false, Ordering::Release);
                return Err(SessionError::from(e));
            }
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.writer = Some(transport);
            inner.device_name = device_name;
            inner.is_ch340 = is_ch340;
        }

        self.reader_stop.store(false, Ordering::Release);
        self.spawn_reader(reader_transport);

        match self.reset(true, prereqs, commit_index) {
            Ok(new_build) => {
                if let Some(info) = self.info() {
                    self.sink.notify(Notification::BoardAttached { info, new_build });
                }
                Ok(())
            }
            Err(e) => {
                self.detach();
                Err(e)
            }
        }
    }

    /// Idempotent: the second call is a no-op (spec §8 property 4).
    pub fn detach(&self) {
        if !self.attached.swap(false, Ordering::AcqRel) {
            return;
        }
        self.reader_stop.store(true, Ordering::Release);
        {
            let mut inner = self.inner.lock().unwrap();
            *inner = SessionInner::default();
        }
        if let Some(handle) = self.reader_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.mode.set(Mode::Console);
        self.sink.notify(Notification::BoardDetached);
    }

    fn spawn_reader(&self, mut transport: Box<dyn SerialTransport>) {
        let mode = self.mode.clone();
        let rx_queue = self.rx_queue.clone();
        let console_channel = self.console_channel.clone();
        let inspector = self.inspector.clone();
        let sink = self.sink.clone();
        let disable_boot_events = self.disable_boot_events.clone();
        let boot_tx = self.boot_tx.clone();
        let stop = self.reader_stop.clone();

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 256];
            loop {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                match transport.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        for &byte in &buf[..n] {
                            match mode.get() {
                                Mode::Rpc => rx_queue.push(byte),
                                Mode::Console => console_channel.push(byte),
                            }
                            let events = inspector.lock().unwrap().push_byte(byte);
                            for event in events {
                                let _ = boot_tx.send(event.clone());
                                if !disable_boot_events.load(Ordering::Acquire) {
                                    if let Some(n) = event_to_notification(&event) {
                                        sink.notify(n);
                                    }
                                }
                            }
                        }
                    }
                    Err(e)
                        if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) =>
                    {
                        continue;
                    }
                    Err(_) => {
                        sink.notify(Notification::BoardDetached);
                        break;
                    }
                }
            }
        });
        *self.reader_handle.lock().unwrap() = Some(handle);
    }

    fn drain_boot_events(&self) {
        let rx = self.boot_rx.lock().unwrap();
        while rx.try_recv().is_ok() {}
    }

    // ---- session-lock plumbing --------------------------------------------

    fn with_session<T>(
        &self,
        timeout_ms: u64,
        body: impl FnOnce(&mut SessionInner) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner.lock().unwrap();
        inner.read_timeout_ms = Some(timeout_ms);
        let result = body(&mut inner);
        inner.read_timeout_ms = None;
        self.mode.set(Mode::Console);
        result
    }

    fn write_bytes(&self, inner: &mut SessionInner, buf: &[u8]) -> Result<()> {
        let writer = inner.writer.as_mut().ok_or(SessionError::PortClosed)?;
        writer.write_all(buf).map_err(SessionError::from)
    }

    fn read_byte(&self, deadline: Instant) -> Result<u8> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::Timeout);
            }
            let wait = remaining.min(Duration::from_millis(200));
            if let Some(b) = self.rx_queue.recv_timeout(wait) {
                return Ok(b);
            }
            if Instant::now() >= deadline {
                return Err(SessionError::Timeout);
            }
        }
    }

    fn read_line(&self, deadline: Instant) -> Result<String> {
        let mut line = Vec::new();
        loop {
            let b = self.read_byte(deadline)?;
            if b == b'\n' {
                break;
            }
            if b != b'\r' {
                line.push(b);
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    // ---- send_command ------------------------------------------------------

    pub fn send_command(&self, text: &str) -> Result<String> {
        self.with_session(DEFAULT_TIMEOUT_MS, |inner| {
            let deadline = Instant::now() + Duration::from_millis(DEFAULT_TIMEOUT_MS);
            self.send_command_locked(inner, text, deadline)
        })
    }

    fn send_command_locked(
        &self,
        inner: &mut SessionInner,
        text: &str,
        deadline: Instant,
    ) -> Result<String> {
        self.mode.set(Mode::Rpc);
        self.rx_queue.drain();

        let prev_shell = inner.shell_enabled;
        if inner.shell_enabled {
            self.write_bytes(inner, b"os.shell(false)\r\n")?;
            let _ = self.read_line(deadline);
            inner.shell_enabled = false;
        }

        self.write_bytes(inner, format!("{text}\r\n").as_bytes())?;
        let echo = self.read_line(deadline)?;
        if echo != text {
            // Tie-break (a), spec §4.4: missing echo is an empty reply, not
            // an error — the command still counts as completed.
            inner.shell_enabled = prev_shell;
            return Ok(String::new());
        }

        let mut lines = Vec::new();
        loop {
            let line = self.read_line(deadline)?;
            if is_prompt(&line) {
                break;
            }
            lines.push(line);
        }
        inner.shell_enabled = prev_shell;
        Ok(lines.join("\r\n"))
    }

    // ---- dir listing --------------------------------------------------------

    pub fn get_dir_content(&self, path: &str) -> Result<Value> {
        let reply = self.send_command(&format!("os.ls(\"{path}\")"))?;
        let mut entries = Vec::new();
        for line in reply.split("\r\n").filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 4 {
                continue;
            }
            entries.push(json!({
                "type": fields[0],
                "size": fields[1],
                "date": fields[2],
                "name": fields[3],
            }));
        }
        Ok(Value::Array(entries))
    }

    // ---- chunked transfer ---------------------------------------------------

    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.with_session(DEFAULT_TIMEOUT_MS, |inner| {
            let deadline = Instant::now() + Duration::from_millis(DEFAULT_TIMEOUT_MS);
            self.write_file_locked(inner, path, data, deadline)
        })
    }

    fn write_file_locked(
        &self,
        inner: &mut SessionInner,
        path: &str,
        data: &[u8],
        deadline: Instant,
    ) -> Result<()> {
        self.mode.set(Mode::Rpc);
        self.rx_queue.drain();

        let cmd = format!("io.receive(\"{path}\")");
        self.write_bytes(inner, format!("{cmd}\r").as_bytes())?;
        let echo = self.read_line(deadline)?;
        if echo != cmd {
            return Err(SessionError::Protocol("write_file command not echoed".into()));
        }

        self.send_chunks_locked(inner, data, deadline)?;

        let status = self.read_line(deadline)?;
        if status != "true" {
            return Err(SessionError::Protocol(
                "write_file missing true trailer".into(),
            ));
        }
        Ok(())
    }

    fn send_chunks_locked(
        &self,
        inner: &mut SessionInner,
        data: &[u8],
        deadline: Instant,
    ) -> Result<()> {
        let mut offset = 0;
        loop {
            let ready = self.read_line(deadline)?;
            if ready != "C" {
                return Err(SessionError::Protocol(format!(
                    "unexpected chunk-ready line: {ready:?}"
                )));
            }
            let remaining = data.len() - offset;
            let n = remaining.min(CHUNK_SIZE);
            self.write_bytes(inner, &[n as u8])?;
            if n == 0 {
                break;
            }
            self.write_bytes(inner, &data[offset..offset + n])?;
            offset += n;
        }
        Ok(())
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.with_session(DEFAULT_TIMEOUT_MS, |inner| {
            let deadline = Instant::now() + Duration::from_millis(DEFAULT_TIMEOUT_MS);
            self.read_file_locked(inner, path, deadline)
        })
    }

    fn read_file_locked(
        &self,
        inner: &mut SessionInner,
        path: &str,
        deadline: Instant,
    ) -> Result<Vec<u8>> {
        self.mode.set(Mode::Rpc);
        self.rx_queue.drain();

        let cmd = format!("io.send(\"{path}\")");
        self.write_bytes(inner, format!("{cmd}\r").as_bytes())?;
        let echo = self.read_line(deadline)?;
        if echo != cmd {
            return Err(SessionError::Protocol("read_file command not echoed".into()));
        }

        let mut out = Vec::new();
        loop {
            self.write_bytes(inner, b"C\n")?;
            let n = self.read_byte(deadline)? as usize;
            if n == 0 {
                break;
            }
            for _ in 0..n {
                out.push(self.read_byte(deadline)?);
            }
        }
        Ok(out)
    }

    // ---- run_code / run_program ----------------------------------------------

    pub fn run_code(&self, code: &[u8]) -> Result<()> {
        self.with_session(DEFAULT_TIMEOUT_MS, |inner| {
            let deadline = Instant::now() + Duration::from_millis(DEFAULT_TIMEOUT_MS);
            self.mode.set(Mode::Rpc);
            self.rx_queue.drain();
            self.write_bytes(inner, b"os.run()\r")?;
            let _echo = self.read_line(deadline)?;
            self.send_chunks_locked(inner, code, deadline)
        })
    }

    pub fn run_program(&self, path: &str, code: &[u8]) -> Result<()> {
        self.reset(false, None, None)?;
        self.write_file("/autorun.lua", format!("dofile(\"{path}\")").as_bytes())?;
        self.write_file(path, code)?;
        self.with_session(DEFAULT_TIMEOUT_MS, |inner| {
            self.mode.set(Mode::Rpc);
            self.write_bytes(
                inner,
                format!("require(\"block\");wcBlock.delevepMode=true;dofile(\"{path}\")\r")
                    .as_bytes(),
            )
        })
    }

    // ---- reset / boot sequence ------------------------------------------------

    pub fn reset(
        &self,
        with_prerequisites: bool,
        prereqs: Option<&dyn PrerequisitesSource>,
        commit_index: Option<&dyn CommitIndex>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.read_timeout_ms = Some(DEFAULT_TIMEOUT_MS);
        let result = self.reset_locked(&mut inner, with_prerequisites, prereqs, commit_index);
        inner.read_timeout_ms = None;
        self.mode.set(Mode::Console);
        result
    }

    fn reset_locked(
        &self,
        inner: &mut SessionInner,
        with_prerequisites: bool,
        prereqs: Option<&dyn PrerequisitesSource>,
        commit_index: Option<&dyn CommitIndex>,
    ) -> Result<bool> {
        self.disable_boot_events.store(true, Ordering::SeqCst);
        self.inspector.lock().unwrap().reset_boot_state();
        self.rx_queue.drain();
        self.drain_boot_events();

        // The boot sequence drives off `boot_rx`, which the Reader feeds
        // unconditionally; raw bytes still route through `mode`, though, and
        // nothing drains `rx_queue` while we're waiting on boot events. Park
        // the demultiplexer on the drop-oldest console sink for the duration
        // so a noisy boot (e.g. the 120s `FormattingFilesystem` window) can
        // never fill the bounded `rx_queue` and stall the Reader thread.
        self.mode.set(Mode::Console);

        self.toggle_rts(inner)?;
        let boot_result = self.run_boot_sequence(inner);
        self.disable_boot_events.store(false, Ordering::SeqCst);
        self.sink.notify(Notification::BoardReset);
        boot_result?;

        if with_prerequisites {
            self.ensure_prerequisites(inner, prereqs)?;
        }

        self.load_info_locked(inner, commit_index)
    }

    /// Toggle RTS low/high/low with 10 ms spacing (spec §4.4, §6),
    /// reapplying the bitrate alongside each toggle the way the original
    /// agent's `options.Apply` does.
    fn toggle_rts(&self, inner: &mut SessionInner) -> Result<()> {
        let writer = inner.writer.as_mut().ok_or(SessionError::PortClosed)?;
        writer.set_bitrate(BAUD_RATE)?;
        writer.set_rts(false)?;
        thread::sleep(Duration::from_millis(10));
        writer.set_bitrate(BAUD_RATE)?;
        writer.set_rts(true)?;
        thread::sleep(Duration::from_millis(10));
        writer.set_bitrate(BAUD_RATE)?;
        writer.set_rts(false)?;
        Ok(())
    }

    fn run_boot_sequence(&self, inner: &mut SessionInner) -> Result<()> {
        let is_ch340 = inner.is_ch340;
        let mut state = BootState::WaitBoot;
        let mut deadline = Instant::now() + Duration::from_millis(DEFAULT_TIMEOUT_MS);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::BootTimeout);
            }
            let event = {
                let rx = self.boot_rx.lock().unwrap();
                rx.recv_timeout(remaining)
            };
            let event = match event {
                Ok(e) => e,
                Err(_) => return Err(SessionError::BootTimeout),
            };

            match &event {
                Event::FormattingFilesystem => {
                    deadline = Instant::now() + Duration::from_millis(FORMATTING_TIMEOUT_MS);
                    self.sink
                        .notify(Notification::BoardUpdate { what: "formatting".into() });
                }
                Event::InvalidFirmware | Event::FallbackInterpreter | Event::FlashReadError => {
                    inner.valid_firmware = false;
                    return Err(SessionError::InvalidFirmware);
                }
                _ => {}
            }

            let is_banner_line = |event: &Event| {
                matches!(event, Event::BootingBanner)
                    || matches!(event, Event::Plain { text } if text.contains("Booting Lua RTOS..."))
            };

            match state {
                BootState::WaitBoot => {
                    let advances = matches!(
                        event,
                        Event::PowerOnReset | Event::SoftwareReset | Event::DeepSleepReset
                    ) || (is_ch340 && is_banner_line(&event));
                    if advances {
                        state = BootState::WaitBanner;
                        deadline = Instant::now() + Duration::from_millis(DEFAULT_TIMEOUT_MS);
                    }
                }
                BootState::WaitBanner => {
                    if is_banner_line(&event) {
                        self.write_bytes(inner, &[0x04])?;
                        state = if is_ch340 {
                            BootState::Ready
                        } else {
                            BootState::WaitPromptAborted
                        };
                        deadline = Instant::now() + Duration::from_millis(DEFAULT_TIMEOUT_MS);
                    }
                }
                BootState::WaitPromptAborted => {
                    if matches!(&event, Event::Plain { text } if text.contains(BOOT_SCRIPTS_ABORTED))
                    {
                        state = BootState::Ready;
                    }
                }
                BootState::Ready => unreachable!(),
            }

            if state == BootState::Ready {
                return Ok(());
            }
        }
    }

    /// Ensures `/lib/lua` exists and uploads prerequisite files. Falls back
    /// from a freshly fetched archive, to files already on the board, to
    /// the most recently cached copy; only failing prerequisite setup if
    /// [`PrerequisitesSource::load`] itself reports all three exhausted
    /// (spec §4.4 tie-break (b)).
    fn ensure_prerequisites(
        &self,
        inner: &mut SessionInner,
        prereqs: Option<&dyn PrerequisitesSource>,
    ) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(DEFAULT_TIMEOUT_MS);
        self.send_command_locked(inner, "os.mkdir(\"/lib/lua\")", deadline)?;

        let Some(prereqs) = prereqs else {
            inner.valid_prerequisites = true;
            return Ok(());
        };

        let files = match prereqs.load() {
            Ok(files) => files,
            Err(_) => return Err(SessionError::InvalidPrerequisites),
        };

        for (path, contents) in &files {
            let deadline = Instant::now() + Duration::from_millis(DEFAULT_TIMEOUT_MS);
            self.write_file_locked(inner, path, contents, deadline)?;
        }
        inner.valid_prerequisites = true;
        Ok(())
    }

    /// Issues the introspection call and caches the result. Returns
    /// whether a newer firmware commit is available, per `commit_index`.
    fn load_info_locked(
        &self,
        inner: &mut SessionInner,
        commit_index: Option<&dyn CommitIndex>,
    ) -> Result<bool> {
        let deadline = Instant::now() + Duration::from_millis(DEFAULT_TIMEOUT_MS);
        let raw = self.send_command_locked(inner, "dofile(\"/_info.lua\")", deadline)?;
        let cleaned = strip_trailing_commas(&raw);
        let info: BoardInfo = serde_json::from_str(&cleaned)?;
        inner.shell_enabled = info.shell_enabled;

        let new_build = commit_index
            .and_then(|idx| idx.latest_commit(&info.firmware_name()).ok().flatten())
            .map(|latest| latest != info.commit)
            .unwrap_or(false);

        inner.info = Some(info);
        inner.valid_firmware = true;
        Ok(new_build)
    }

    // ---- upgrade ----------------------------------------------------------

    pub fn upgrade(
        &self,
        install: bool,
        firmware_id: Option<&str>,
        fetcher: &dyn ArchiveFetcher,
        extractor: &dyn ArchiveExtractor,
    ) -> Result<()> {
        let device_name = self.inner.lock().unwrap().device_name.clone();
        self.detach();

        let flasher_archive = fetcher
            .fetch_flasher()
            .map_err(|e| SessionError::Protocol(e.to_string()))?;
        let flasher_dir = std::path::Path::new("./scratch/flasher");
        extractor
            .extract(&flasher_archive, flasher_dir)
            .map_err(|e| SessionError::Protocol(e.to_string()))?;

        let firmware_archive = fetcher
            .fetch_firmware(firmware_id)
            .map_err(|e| SessionError::Protocol(e.to_string()))?;
        let firmware_dir = std::path::Path::new("./scratch/firmware");
        extractor
            .extract(&firmware_archive, firmware_dir)
            .map_err(|e| SessionError::Protocol(e.to_string()))?;

        // Arguments come from `flash_args` (always) and `flashfs_args`
        // (when installing), each with the absolute path of every
        // referenced `*.bin` substituted in, then `--port <dev>` prefixed
        // once — matching the original agent's `upgrade()`.
        let mut args = Self::read_flasher_args(firmware_dir, "flash_args")?;
        if install {
            args.extend(Self::read_flasher_args(firmware_dir, "flashfs_args")?);
        }
        if let Some(dev) = &device_name {
            args.splice(0..0, ["--port".to_string(), dev.clone()]);
        }

        let mut child = std::process::Command::new(flasher_dir.join("flash"))
            .args(&args)
            .current_dir(firmware_dir)
            .stdout(std::process::Stdio::piped())
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            use std::io::BufRead;
            let reader = std::io::BufReader::new(stdout);
            for line in reader.lines().map_while(std::result::Result::ok) {
                self.sink.notify(Notification::BoardUpdate { what: line });
            }
        }
        child.wait()?;
        self.sink.notify(Notification::BoardUpgraded);
        Ok(())
    }

    /// Reads `<dir>/<filename>` (`flash_args` or `flashfs_args`) and splits
    /// it on whitespace into the flasher's argument list, substituting the
    /// absolute path of every whitespace-delimited `*.bin` reference
    /// (spec §4.4, §6 "External collaborators").
    fn read_flasher_args(dir: &std::path::Path, filename: &str) -> Result<Vec<String>> {
        let raw = std::fs::read_to_string(dir.join(filename))?;
        Ok(raw
            .split_whitespace()
            .map(|token| {
                if token.ends_with(".bin") {
                    dir.join(token).to_string_lossy().into_owned()
                } else {
                    token.to_string()
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;

    struct CollectingSink {
        notifications: StdMutex<Vec<Notification>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                notifications: StdMutex::new(Vec::new()),
            })
        }
    }

    impl NotificationSink for CollectingSink {
        fn notify(&self, notification: Notification) {
            self.notifications.lock().unwrap().push(notification);
        }
    }

    fn session_with_mock() -> (Arc<BoardSession>, MockTransport) {
        let sink = CollectingSink::new();
        let session = Arc::new(BoardSession::new(sink));
        let mock = MockTransport::new();
        (session, mock)
    }

    #[test]
    fn send_command_echo_s1() {
        let (session, mock) = session_with_mock();
        session.spawn_reader(Box::new(mock.clone()));
        session.reader_stop.store(false, Ordering::Release);

        let board = mock.clone();
        thread::spawn(move || {
            loop {
                let written = board.drain_to_board();
                if written == b"print(1)\r\n" {
                    board.push_from_board(b"print(1)\r\n1\r\n/home > \r\n");
                    break;
                }
                thread::sleep(Duration::from_millis(2));
            }
        });

        let reply = session.send_command("print(1)").unwrap();
        assert_eq!(reply, "1");
        assert_eq!(session.mode.get(), Mode::Console);

        session.reader_stop.store(true, Ordering::Release);
    }

    #[test]
    fn chunked_upload_round_trip_s2() {
        let (session, mock) = session_with_mock();
        session.spawn_reader(Box::new(mock.clone()));
        session.reader_stop.store(false, Ordering::Release);

        let data: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
        let board = mock.clone();
        let expected_cmd = b"io.receive(\"/a\")\r".to_vec();
        thread::spawn(move || {
            // Echo the command.
            loop {
                let written = board.drain_to_board();
                if written == expected_cmd {
                    board.push_from_board(b"io.receive(\"/a\")\r\n");
                    break;
                }
                thread::sleep(Duration::from_millis(2));
            }
            let mut received = Vec::new();
            loop {
                board.push_from_board(b"C\r\n");
                // length byte
                let len = loop {
                    let w = board.drain_to_board();
                    if !w.is_empty() {
                        break w[0];
                    }
                    thread::sleep(Duration::from_millis(2));
                };
                if len == 0 {
                    board.push_from_board(b"true\r\n");
                    break;
                }
                let mut chunk = Vec::new();
                while chunk.len() < len as usize {
                    let w = board.drain_to_board();
                    chunk.extend(w);
                    if chunk.len() < len as usize {
                        thread::sleep(Duration::from_millis(2));
                    }
                }
                received.extend(chunk);
            }
            assert_eq!(received.len(), 300);
        });

        session.write_file("/a", &data).unwrap();
        session.reader_stop.store(true, Ordering::Release);
    }

    #[test]
    fn chunked_download_empty_file_s3() {
        let (session, mock) = session_with_mock();
        session.spawn_reader(Box::new(mock.clone()));
        session.reader_stop.store(false, Ordering::Release);

        let board = mock.clone();
        thread::spawn(move || {
            loop {
                let written = board.drain_to_board();
                if written == b"io.send(\"/empty\")\r".to_vec() {
                    board.push_from_board(b"io.send(\"/empty\")\r\n");
                    break;
                }
                thread::sleep(Duration::from_millis(2));
            }
            loop {
                let written = board.drain_to_board();
                if written == b"C\n" {
                    board.push_from_board(&[0u8]);
                    break;
                }
                thread::sleep(Duration::from_millis(2));
            }
        });

        let content = session.read_file("/empty").unwrap();
        assert!(content.is_empty());
        session.reader_stop.store(true, Ordering::Release);
    }

    #[test]
    fn strips_trailing_commas_from_info_blob() {
        let raw = r#"{"build":"1","commit":"abc",}"#;
        assert_eq!(strip_trailing_commas(raw), r#"{"build":"1","commit":"abc"}"#);
    }

    #[test]
    fn detach_without_attach_is_a_noop() {
        let (session, _mock) = session_with_mock();
        session.detach();
        session.detach();
        assert!(!session.is_attached());
    }
}
