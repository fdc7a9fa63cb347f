//! Line Inspector (spec §4.2).
//!
//! Consumes raw bytes one at a time, assembles CR/LF-terminated lines, and
//! classifies each completed line against a fixed, ordered table of
//! patterns. The pattern table is kept as data (design note, spec §9) —
//! a slice of `(Regex, fn(&Captures) -> Event)` built once.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use std::sync::LazyLock;

/// Closed set of events the inspector can produce. Consumers subscribe by
/// variant; each variant carries only the fields named in spec §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PowerOnReset,
    SoftwareReset,
    DeepSleepReset,
    BlockStart { block: String },
    BlockEnd { block: String },
    BlockError { block: String, error: String },
    BlockErrorCatched { block: String },
    RuntimeError {
        location: String,
        line: String,
        exception: String,
        message: String,
    },
    RuntimeWarning {
        location: String,
        line: String,
        exception: String,
        message: String,
    },
    FormattingFilesystem,
    InvalidFirmware,
    FallbackInterpreter,
    FlashReadError,
    BootingBanner,
    Prompt,
    Plain { text: String },
}

fn b64(s: &str) -> String {
    BASE64.encode(s.as_bytes())
}

struct Patterns {
    poweron_reset: Regex,
    software_reset: Regex,
    deepsleep_reset: Regex,
    block_start: Regex,
    block_end: Regex,
    block_error: Regex,
    block_error_catched: Regex,
    runtime_error_with_exc: Regex,
    runtime_error_no_exc: Regex,
    invalid_firmware_verify: Regex,
    invalid_firmware_partitions: Regex,
    fallback_interpreter: Regex,
    flash_read_err: Regex,
    formatting: Regex,
    booting_banner: Regex,
    prompt: Regex,
    leading_prompt: Regex,
}

static PATTERNS: LazyLock<Patterns> = LazyLock::new(|| Patterns {
    poweron_reset: Regex::new(r"^rst:.*\(POWERON_RESET\),boot:.*$").unwrap(),
    software_reset: Regex::new(r"^rst:.*\(SW_CPU_RESET\),boot:.*$").unwrap(),
    deepsleep_reset: Regex::new(r"^rst:.*\(DEEPSLEEP_RESET\),boot.*$").unwrap(),
    block_start: Regex::new(r"<blockStart,(.*)>").unwrap(),
    block_end: Regex::new(r"<blockEnd,(.*)>").unwrap(),
    block_error: Regex::new(r"<blockError,(.*),(.*)>").unwrap(),
    block_error_catched: Regex::new(r"<blockErrorCatched,(.*)>").unwrap(),
    runtime_error_with_exc: Regex::new(r"^([a-zA-Z]*):(\d*):\s(\d*):(.*)$").unwrap(),
    runtime_error_no_exc: Regex::new(r"^([a-zA-Z]*):(\d*):\s*(.*)$").unwrap(),
    invalid_firmware_verify: Regex::new(r"^.*boot: Failed to verify app image.*$").unwrap(),
    invalid_firmware_partitions: Regex::new(r"^.*boot: No bootable app partitions.*$").unwrap(),
    fallback_interpreter: Regex::new(r"^Falling back to built-in command interpreter\.$").unwrap(),
    flash_read_err: Regex::new(r"^flash read err,.*$").unwrap(),
    formatting: Regex::new(r"(?i)^.*format(t?)ing .*$").unwrap(),
    booting_banner: Regex::new(r"Booting Lua RTOS\.\.\.").unwrap(),
    prompt: Regex::new(r"^/.*>.*$").unwrap(),
    leading_prompt: Regex::new(r"^/[^>]*>\s*").unwrap(),
});

/// Occurrences required before `Falling back to built-in command
/// interpreter.` or `flash read err,...` are treated as definitive (spec
/// §4.2 firmware-validity threshold). `boot: Failed to verify app image`
/// and `boot: No bootable app partitions...` are definitive on first
/// sight, matching the original agent's `waitForReady`.
const FIRMWARE_VALIDITY_THRESHOLD: u32 = 4;

pub struct LineInspector {
    line: String,
    fallback_count: u32,
    flash_read_err_count: u32,
}

impl Default for LineInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl LineInspector {
    pub fn new() -> Self {
        Self {
            line: String::new(),
            fallback_count: 0,
            flash_read_err_count: 0,
        }
    }

    /// Resets per-boot counters. Called at the start of each `reset()`.
    pub fn reset_boot_state(&mut self) {
        self.fallback_count = 0;
        self.flash_read_err_count = 0;
    }

    /// Feed one byte. Returns the events produced when this byte completes
    /// a line (empty otherwise). `\r` is discarded from accumulated text;
    /// every other byte accumulates regardless of classification.
    pub fn push_byte(&mut self, byte: u8) -> Vec<Event> {
        if byte == b'\n' {
            let line = std::mem::take(&mut self.line);
            self.classify(&line)
        } else {
            if byte != b'\r' {
                self.line.push(byte as char);
            }
            Vec::new()
        }
    }

    fn classify(&mut self, line: &str) -> Vec<Event> {
        let p = &*PATTERNS;
        let mut events = Vec::new();

        if p.poweron_reset.is_match(line) {
            events.push(Event::PowerOnReset);
        } else if p.software_reset.is_match(line) {
            events.push(Event::SoftwareReset);
        } else if p.deepsleep_reset.is_match(line) {
            events.push(Event::DeepSleepReset);
        }

        if let Some(c) = p.block_start.captures(line) {
            events.push(Event::BlockStart {
                block: b64(&c[1]),
            });
        }
        if let Some(c) = p.block_end.captures(line) {
            events.push(Event::BlockEnd { block: b64(&c[1]) });
        }
        if let Some(c) = p.block_error.captures(line) {
            events.push(Event::BlockError {
                block: b64(&c[1]),
                error: b64(&c[2]),
            });
        }
        if let Some(c) = p.block_error_catched.captures(line) {
            events.push(Event::BlockErrorCatched {
                block: b64(&c[1]),
            });
        }

        // Diagnostics are matched after stripping a leading shell prompt
        // (spec §4.2), since the board can emit them mid-line after echoing
        // one. WHERE:LINE: EXC:MSG tried first; fall back to WHERE:LINE: MSG
        // (exception = "0") only if that does not match.
        let diagnostics_line = p.leading_prompt.replace(line, "");
        let diagnostics_line = diagnostics_line.as_ref();
        if let Some(c) = p.runtime_error_with_exc.captures(diagnostics_line) {
            let message = b64(&c[4]);
            let exception = c[3].to_string();
            let event = if c[4].starts_with("WARNING ") {
                Event::RuntimeWarning {
                    location: c[1].to_string(),
                    line: c[2].to_string(),
                    exception,
                    message,
                }
            } else {
                Event::RuntimeError {
                    location: c[1].to_string(),
                    line: c[2].to_string(),
                    exception,
                    message,
                }
            };
            events.push(event);
        } else if let Some(c) = p.runtime_error_no_exc.captures(diagnostics_line) {
            let message = b64(&c[3]);
            let event = if c[3].starts_with("WARNING ") {
                Event::RuntimeWarning {
                    location: c[1].to_string(),
                    line: c[2].to_string(),
                    exception: "0".to_string(),
                    message,
                }
            } else {
                Event::RuntimeError {
                    location: c[1].to_string(),
                    line: c[2].to_string(),
                    exception: "0".to_string(),
                    message,
                }
            };
            events.push(event);
        }

        if p.invalid_firmware_verify.is_match(line) || p.invalid_firmware_partitions.is_match(line)
        {
            events.push(Event::InvalidFirmware);
        }

        if p.fallback_interpreter.is_match(line) {
            self.fallback_count += 1;
            if self.fallback_count == FIRMWARE_VALIDITY_THRESHOLD {
                events.push(Event::FallbackInterpreter);
            }
        }

        if p.flash_read_err.is_match(line) {
            self.flash_read_err_count += 1;
            if self.flash_read_err_count == FIRMWARE_VALIDITY_THRESHOLD {
                events.push(Event::FlashReadError);
            }
        }

        if p.formatting.is_match(line) {
            events.push(Event::FormattingFilesystem);
        }

        if p.booting_banner.is_match(line) {
            events.push(Event::BootingBanner);
        }

        if p.prompt.is_match(line) {
            events.push(Event::Prompt);
        }

        events.push(Event::Plain {
            text: line.to_string(),
        });

        events
    }
}

/// `^/.*>.*$` — the Lua RTOS shell prompt, exposed separately because the
/// chunked-transfer and RPC code paths match it against raw lines they read
/// from `rx_queue`, not against inspector events.
pub fn is_prompt(line: &str) -> bool {
    PATTERNS.prompt.is_match(line)
}

/// The literal line that signals the boot state machine has reached
/// `READY`. Not a distinct [`Event`] variant per the closed set in spec
/// §3 — the boot sequence matches it directly against `Event::Plain` text,
/// the same way it matches the prompt pattern against raw lines.
pub const BOOT_SCRIPTS_ABORTED: &str = "Lua RTOS-boot-scripts-aborted-ESP32";

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(inspector: &mut LineInspector, s: &str) -> Vec<Event> {
        let mut events = Vec::new();
        for b in s.bytes() {
            events.extend(inspector.push_byte(b));
        }
        events
    }

    #[test]
    fn classifies_poweron_reset() {
        let mut i = LineInspector::new();
        let events = feed(&mut i, "rst:0x1 (POWERON_RESET),boot:0x13\n");
        assert!(events.contains(&Event::PowerOnReset));
    }

    #[test]
    fn classifies_runtime_error_s4() {
        let mut i = LineInspector::new();
        let events = feed(&mut i, "main:12: 5:nil indexing\n");
        assert!(events.contains(&Event::RuntimeError {
            location: "main".into(),
            line: "12".into(),
            exception: "5".into(),
            message: b64("nil indexing"),
        }));
    }

    #[test]
    fn runtime_warning_from_message_prefix() {
        let mut i = LineInspector::new();
        let events = feed(&mut i, "main:3: 0:WARNING low memory\n");
        assert!(matches!(events.iter().find(|e| matches!(e, Event::RuntimeWarning{..})),
            Some(Event::RuntimeWarning { message, .. }) if message == &b64("WARNING low memory")));
    }

    #[test]
    fn block_events_are_base64_encoded() {
        let mut i = LineInspector::new();
        let events = feed(&mut i, "<blockStart,move_forward>\n");
        assert!(events.contains(&Event::BlockStart {
            block: b64("move_forward"),
        }));
    }

    #[test]
    fn formatting_line_is_case_insensitive_and_tolerates_typo() {
        let mut i = LineInspector::new();
        assert!(feed(&mut i, "now formatting filesystem\n").contains(&Event::FormattingFilesystem));
        let mut i2 = LineInspector::new();
        assert!(feed(&mut i2, "now formating filesystem\n").contains(&Event::FormattingFilesystem));
    }

    #[test]
    fn fallback_interpreter_requires_four_occurrences() {
        let mut i = LineInspector::new();
        for _ in 0..3 {
            let events = feed(&mut i, "Falling back to built-in command interpreter.\n");
            assert!(!events.contains(&Event::FallbackInterpreter));
        }
        let events = feed(&mut i, "Falling back to built-in command interpreter.\n");
        assert!(events.contains(&Event::FallbackInterpreter));
    }

    #[test]
    fn invalid_firmware_is_immediate() {
        let mut i = LineInspector::new();
        let events = feed(&mut i, "boot: Failed to verify app image\n");
        assert!(events.contains(&Event::InvalidFirmware));
    }

    #[test]
    fn prompt_detection() {
        assert!(is_prompt("/home > "));
        assert!(!is_prompt("hello world"));
    }

    #[test]
    fn runtime_error_after_leading_prompt_is_stripped() {
        let mut i = LineInspector::new();
        let events = feed(&mut i, "/home > main:12: 5:nil indexing\n");
        assert!(events.contains(&Event::RuntimeError {
            location: "main".into(),
            line: "12".into(),
            exception: "5".into(),
            message: b64("nil indexing"),
        }));
    }

    #[test]
    fn cr_is_stripped_lf_terminates() {
        let mut i = LineInspector::new();
        let events = feed(&mut i, "hello\r\n");
        assert!(events.contains(&Event::Plain {
            text: "hello".into()
        }));
    }
}
