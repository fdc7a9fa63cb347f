//! Adapter Registry (spec §4.5).
//!
//! Loads the set of `{vendor_id, product_id}` descriptors identifying
//! acceptable USB-serial adapters from a directory of JSON files, grounded
//! in the original agent's `loadAdapters` (`./adapters/defs/*.json`). VID
//! and PID are normalized to lower-case hex with a `0x` prefix on load so
//! every later comparison is a plain string match.

use std::path::Path;

use serde::Deserialize;

use crate::transport::PortInfo;

#[derive(Debug, Clone, Deserialize)]
struct RawDevice {
    #[serde(rename = "VendorId")]
    vendor_id: String,
    #[serde(rename = "ProductId")]
    product_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawAdapterDef {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Devices")]
    devices: Vec<RawDevice>,
}

/// One supported adapter: a name and the VID:PID pairs that identify it.
#[derive(Debug, Clone)]
pub struct AdapterDef {
    pub id: String,
    pub devices: Vec<(String, String)>,
}

/// Normalizes a VID/PID string (bare hex, or already `0x`-prefixed, any
/// case) to lower-case hex with a `0x` prefix.
fn normalize_hex(raw: &str) -> String {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    format!("0x{}", digits.to_lowercase())
}

fn normalize_u16(v: u16) -> String {
    format!("0x{:x}", v)
}

/// Holds every adapter descriptor loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    adapters: Vec<AdapterDef>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Reads every `*.json` file directly inside `dir`. Missing directory
    /// or unreadable/malformed files are skipped, matching the original
    /// agent's best-effort `loadAdapters` (startup must not fail just
    /// because no descriptors happen to be installed yet).
    pub fn load_from_dir(dir: &Path) -> Self {
        let mut adapters = Vec::new();

        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return Self { adapters },
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(raw) = serde_json::from_str::<RawAdapterDef>(&contents) else {
                continue;
            };
            adapters.push(AdapterDef {
                id: raw.id,
                devices: raw
                    .devices
                    .into_iter()
                    .map(|d| (normalize_hex(&d.vendor_id), normalize_hex(&d.product_id)))
                    .collect(),
            });
        }

        Self { adapters }
    }

    /// True if `port`'s VID:PID appears in the union of every loaded
    /// descriptor's device set.
    pub fn matches(&self, port: &PortInfo) -> bool {
        let vid = normalize_u16(port.vendor_id);
        let pid = normalize_u16(port.product_id);
        self.adapters
            .iter()
            .any(|a| a.devices.iter().any(|(v, p)| *v == vid && *p == pid))
    }

    /// The QinHeng CH340 adapter (VID:PID `0x1a86:0x7523`) has no reliable
    /// `rst:` line on reset and uses `Booting Lua RTOS...` for both the
    /// banner and the readiness gate (spec §4.4).
    pub fn is_ch340(port: &PortInfo) -> bool {
        normalize_u16(port.vendor_id) == "0x1a86" && normalize_u16(port.product_id) == "0x7523"
    }

    /// Seeds an extra descriptor at runtime, e.g. one the IDE supplies in
    /// `attachIde`'s `devices` argument alongside the on-disk set.
    pub fn add_descriptor(&mut self, id: String, devices: Vec<(String, String)>) {
        let devices = devices
            .into_iter()
            .map(|(v, p)| (normalize_hex(&v), normalize_hex(&p)))
            .collect();
        self.adapters.push(AdapterDef { id, devices });
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_mixed_case_and_prefix() {
        assert_eq!(normalize_hex("1A86"), "0x1a86");
        assert_eq!(normalize_hex("0X1A86"), "0x1a86");
        assert_eq!(normalize_hex("0x1a86"), "0x1a86");
    }

    #[test]
    fn matches_against_loaded_descriptor() {
        let registry = AdapterRegistry {
            adapters: vec![AdapterDef {
                id: "ch340".into(),
                devices: vec![("0x1a86".into(), "0x7523".into())],
            }],
        };
        let port = PortInfo {
            device_name: "/dev/ttyUSB0".into(),
            vendor_id: 0x1a86,
            product_id: 0x7523,
        };
        assert!(registry.matches(&port));

        let other = PortInfo {
            device_name: "/dev/ttyUSB1".into(),
            vendor_id: 0x0403,
            product_id: 0x6001,
        };
        assert!(!registry.matches(&other));
    }

    #[test]
    fn ch340_detection() {
        let port = PortInfo {
            device_name: "COM3".into(),
            vendor_id: 0x1a86,
            product_id: 0x7523,
        };
        assert!(AdapterRegistry::is_ch340(&port));
    }

    #[test]
    fn missing_directory_yields_empty_registry() {
        let registry = AdapterRegistry::load_from_dir(Path::new("/nonexistent/path/xyz"));
        assert!(registry.is_empty());
    }
}
