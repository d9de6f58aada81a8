// src/firmware.rs - Firmware dialects, capability flags and identification
use serde::{Deserialize, Serialize};
use std::fmt;

/// Command sent to ask the controller who it is.
pub const IDENTIFY_COMMAND: &str = "M115";

/// Closed set of firmware dialects the host knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    GenericMarlin,
    Prusa,
    Klipper,
    Unknown,
}

impl Dialect {
    pub const ALL: [Dialect; 4] = [
        Dialect::GenericMarlin,
        Dialect::Prusa,
        Dialect::Klipper,
        Dialect::Unknown,
    ];

    /// Dialect-specific overrides. Adding a dialect means adding a variant and a row here.
    pub fn profile(self) -> &'static DialectProfile {
        match self {
            Dialect::GenericMarlin => &MARLIN_PROFILE,
            Dialect::Prusa => &PRUSA_PROFILE,
            Dialect::Klipper => &KLIPPER_PROFILE,
            Dialect::Unknown => &UNKNOWN_PROFILE,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "marlin" | "genericmarlin" | "generic_marlin" => Some(Dialect::GenericMarlin),
            "prusa" => Some(Dialect::Prusa),
            "klipper" => Some(Dialect::Klipper),
            "unknown" => Some(Dialect::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::GenericMarlin => write!(f, "Marlin"),
            Dialect::Prusa => write!(f, "Prusa"),
            Dialect::Klipper => write!(f, "Klipper"),
            Dialect::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Feature flags that change how the host drives the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_checksums: bool,
    pub supports_mesh_leveling: bool,
    pub supports_host_pause: bool,
    pub supports_auto_temp_report: bool,
    pub supports_emergency_parser: bool,
}

/// Static per-dialect table entry.
#[derive(Debug)]
pub struct DialectProfile {
    pub dialect: Dialect,
    pub display_name: &'static str,
    pub pause_command: Option<&'static str>,
    pub resume_command: Option<&'static str>,
    pub stop_command: &'static str,
    pub leveling_command: Option<&'static str>,
    pub defaults: Capabilities,
}

static MARLIN_PROFILE: DialectProfile = DialectProfile {
    dialect: Dialect::GenericMarlin,
    display_name: "Marlin",
    pause_command: Some("M76"),
    resume_command: Some("M75"),
    stop_command: "M112",
    leveling_command: Some("G29"),
    defaults: Capabilities {
        supports_checksums: true,
        supports_mesh_leveling: true,
        supports_host_pause: true,
        supports_auto_temp_report: false,
        supports_emergency_parser: false,
    },
};

static PRUSA_PROFILE: DialectProfile = DialectProfile {
    dialect: Dialect::Prusa,
    display_name: "Prusa Firmware",
    pause_command: Some("M601"),
    resume_command: Some("M602"),
    stop_command: "M112",
    leveling_command: Some("G80"),
    defaults: Capabilities {
        supports_checksums: true,
        supports_mesh_leveling: true,
        supports_host_pause: true,
        supports_auto_temp_report: true,
        supports_emergency_parser: true,
    },
};

static KLIPPER_PROFILE: DialectProfile = DialectProfile {
    dialect: Dialect::Klipper,
    display_name: "Klipper",
    pause_command: Some("PAUSE"),
    resume_command: Some("RESUME"),
    stop_command: "M112",
    leveling_command: Some("BED_MESH_CALIBRATE"),
    defaults: Capabilities {
        supports_checksums: false,
        supports_mesh_leveling: true,
        supports_host_pause: true,
        supports_auto_temp_report: false,
        supports_emergency_parser: true,
    },
};

static UNKNOWN_PROFILE: DialectProfile = DialectProfile {
    dialect: Dialect::Unknown,
    display_name: "Unknown firmware",
    pause_command: None,
    resume_command: None,
    stop_command: "M112",
    leveling_command: None,
    defaults: Capabilities {
        supports_checksums: false,
        supports_mesh_leveling: false,
        supports_host_pause: false,
        supports_auto_temp_report: false,
        supports_emergency_parser: false,
    },
};

/// What the identification step learned about the controller. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareIdentity {
    pub dialect: Dialect,
    pub display_name: String,
    pub raw: String,
    pub capabilities: Capabilities,
}

impl FirmwareIdentity {
    /// Classify an identification reply. Returns `None` when nothing usable came back.
    ///
    /// Marker precedence matters: Prusa firmware advertises itself as "based on Marlin",
    /// so the vendor markers are checked before the generic Marlin ones.
    pub fn classify(response: &str) -> Option<Self> {
        let raw = response.trim();
        if !is_meaningful(raw) {
            return None;
        }

        let dialect = if raw.contains("Klipper") {
            Dialect::Klipper
        } else if raw.contains("Prusa") {
            Dialect::Prusa
        } else if raw.contains("Marlin") || raw.lines().any(|l| l.trim_start().starts_with("echo:")) {
            Dialect::GenericMarlin
        } else {
            Dialect::Unknown
        };

        let profile = dialect.profile();
        let mut capabilities = profile.defaults;
        apply_capability_report(&mut capabilities, raw);

        let display_name = firmware_name(raw)
            .map(str::to_string)
            .unwrap_or_else(|| profile.display_name.to_string());

        Some(Self {
            dialect,
            display_name,
            raw: raw.to_string(),
            capabilities,
        })
    }

    /// Identity used when a controller answers but never produced an identification reply.
    pub fn unknown(raw: impl Into<String>) -> Self {
        let profile = Dialect::Unknown.profile();
        Self {
            dialect: Dialect::Unknown,
            display_name: profile.display_name.to_string(),
            raw: raw.into(),
            capabilities: profile.defaults,
        }
    }

    pub fn profile(&self) -> &'static DialectProfile {
        self.dialect.profile()
    }
}

/// A response is usable when at least one line is plain printable ASCII.
/// Line noise from a wrong baud rate decodes to replacement characters and fails this.
pub fn is_meaningful(text: &str) -> bool {
    text.lines().any(|line| {
        let line = line.trim();
        line.len() >= 2 && line.chars().all(|c| c.is_ascii_graphic() || c == ' ')
    })
}

/// Extract the `FIRMWARE_NAME:` value, up to the next `KEY:` token.
fn firmware_name(raw: &str) -> Option<&str> {
    let start = raw.find("FIRMWARE_NAME:")? + "FIRMWARE_NAME:".len();
    let rest = &raw[start..];
    let line_end = rest.find(['\n', '\r']).unwrap_or(rest.len());
    let rest = &rest[..line_end];
    let end = [
        " SOURCE_CODE_URL:",
        " FIRMWARE_URL:",
        " FIRMWARE_VERSION:",
        " PROTOCOL_VERSION:",
        " MACHINE_TYPE:",
    ]
    .iter()
    .filter_map(|key| rest.find(key))
    .min()
    .unwrap_or(rest.len());
    let name = rest[..end].trim();
    if name.is_empty() { None } else { Some(name) }
}

/// `Cap:NAME:1` lines override the dialect defaults.
fn apply_capability_report(caps: &mut Capabilities, raw: &str) {
    for line in raw.lines() {
        let Some(rest) = line.trim().strip_prefix("Cap:") else {
            continue;
        };
        let mut parts = rest.splitn(2, ':');
        let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let enabled = value.trim() == "1";
        match name.trim() {
            "AUTOREPORT_TEMP" => caps.supports_auto_temp_report = enabled,
            "EMERGENCY_PARSER" => caps.supports_emergency_parser = enabled,
            "HOST_ACTION_COMMANDS" | "PAUSE_PRINT" => caps.supports_host_pause = enabled,
            "BED_LEVELING" | "MESH_LEVELING" => caps.supports_mesh_leveling = enabled,
            _ => {}
        }
    }
}
