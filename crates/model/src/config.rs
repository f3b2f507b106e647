//! TOML configuration schemas for exporter place descriptions and agent
//! import descriptions (§6). Fields are validated eagerly at load time;
//! unknown fields are rejected rather than silently ignored.

use crate::import_spec::{ImportSpec, PartSpec, TcpWant, UsbWant};
use crate::place::{Part, TcpEndpoint};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("{0}")]
    Validation(String),
}

fn read_to_string(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlTcpEndpoint {
    host: String,
    port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlUsbEndpoint {
    usbid: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlPart {
    #[serde(default)]
    compatible: BTreeSet<String>,
    #[serde(default)]
    tcp: BTreeMap<String, TomlTcpEndpoint>,
    #[serde(default)]
    usb: BTreeMap<String, TomlUsbEndpoint>,
}

/// The exporter-side place description: `port` plus an array of parts.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportDescription {
    pub port: u16,
    #[serde(default)]
    parts: Vec<TomlPart>,
}

impl ExportDescription {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = read_to_string(path)?;
        let desc: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        desc.validate()?;
        Ok(desc)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (pidx, p) in self.parts.iter().enumerate() {
            for (name, usb) in &p.usb {
                if parse_bus_id(&usb.usbid).is_none() {
                    return Err(ConfigError::Validation(format!(
                        "part[{pidx}].usb.{name}: invalid bus id {:?}, expected <bus>-<path>",
                        usb.usbid
                    )));
                }
            }
        }
        Ok(())
    }

    /// Converts the validated TOML description into runtime [`Part`]s.
    pub fn parts(&self) -> Vec<Part> {
        self.parts
            .iter()
            .map(|p| Part {
                compatible: p.compatible.clone(),
                tcp: p
                    .tcp
                    .iter()
                    .map(|(name, e)| {
                        (
                            name.clone(),
                            TcpEndpoint {
                                host: e.host.clone(),
                                port: e.port,
                            },
                        )
                    })
                    .collect(),
                usb: p
                    .usb
                    .iter()
                    .map(|(name, e)| (name.clone(), e.usbid.clone()))
                    .collect(),
            })
            .collect()
    }
}

/// Validates the `<bus>-<path>` shape of a USB bus ID without over-fitting
/// to a specific numbering scheme.
pub fn parse_bus_id(s: &str) -> Option<(&str, &str)> {
    let (bus, path) = s.split_once('-')?;
    if bus.is_empty() || path.is_empty() {
        return None;
    }
    Some((bus, path))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlImportTcp {
    local_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlImportUsb {
    port_num: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlImportPart {
    #[serde(default)]
    compatible: BTreeSet<String>,
    #[serde(default)]
    tcp: BTreeMap<String, TomlImportTcp>,
    #[serde(default)]
    usb: BTreeMap<String, TomlImportUsb>,
}

fn default_auto_return_secs() -> u64 {
    10 * 3600
}

/// The agent-side import description.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportDescription {
    #[serde(default = "default_auto_return_secs")]
    auto_return_time: u64,
    #[serde(default)]
    parts: BTreeMap<String, TomlImportPart>,
}

impl ImportDescription {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = read_to_string(path)?;
        let desc: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        desc.validate()?;
        Ok(desc)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, part) in &self.parts {
            for (iface, usb) in &part.usb {
                if usb.port_num > 7 {
                    return Err(ConfigError::Validation(format!(
                        "parts.{name}.usb.{iface}: port_num {} out of range [0,7]",
                        usb.port_num
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn into_import_spec(self) -> ImportSpec {
        let parts = self
            .parts
            .into_iter()
            .map(|(name, p)| {
                let spec = PartSpec {
                    compatible: p.compatible,
                    tcp: p
                        .tcp
                        .into_iter()
                        .map(|(n, t)| (n, TcpWant { local_port: t.local_port }))
                        .collect(),
                    usb: p
                        .usb
                        .into_iter()
                        .map(|(n, u)| (n, UsbWant { port_num: u.port_num }))
                        .collect(),
                };
                (name, spec)
            })
            .collect();
        ImportSpec {
            auto_return_time: Duration::from_secs(self.auto_return_time),
            parts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_fields() {
        let toml = r#"
            port = 2192
            bogus = true
        "#;
        let err = toml::from_str::<ExportDescription>(toml).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn rejects_bad_bus_id() {
        let toml = r#"
            port = 2192
            [[parts]]
            compatible = ["x"]
            [parts.usb.dut]
            usbid = "nodash"
        "#;
        let err = toml::from_str::<ExportDescription>(toml)
            .unwrap()
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn rejects_out_of_range_port_num() {
        let toml = r#"
            auto_return_time = 0
            [parts.a]
            compatible = ["x"]
            [parts.a.usb.dut]
            port_num = 9
        "#;
        let err: ConfigError = toml::from_str::<ImportDescription>(toml)
            .unwrap()
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn parses_happy_path_export() {
        let toml = r#"
            port = 2192
            [[parts]]
            compatible = ["x"]
            [parts.tcp.scpi]
            host = "127.0.0.1"
            port = 5025
        "#;
        let desc = toml::from_str::<ExportDescription>(toml).unwrap();
        desc.validate().unwrap();
        assert_eq!(desc.parts().len(), 1);
        assert_eq!(desc.parts()[0].tcp["scpi"].port, 5025);
    }
}
