//! Line framing and response parsing for the G-code serial protocol.
//!
//! Outbound lines are either sent bare (`G28`) or wrapped with a line number and
//! an XOR checksum (`N12 G28*34`). Inbound lines are classified into [`AckEvent`]s.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("line has a checksum but no line number: {0}")]
    MissingLineNumber(String),
    #[error("line number is not numeric: {0}")]
    BadLineNumber(String),
    #[error("numbered line has no checksum: {0}")]
    MissingChecksum(String),
    #[error("checksum is not numeric: {0}")]
    BadChecksum(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

/// Running XOR over every byte of the line.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Wrap a command as `N<seq> <command>*<checksum>`.
pub fn frame_command(seq: u32, command: &str) -> String {
    let body = format!("N{} {}", seq, command.trim());
    let cs = checksum(body.as_bytes());
    format!("{}*{}", body, cs)
}

/// A line as the firmware sees it after stripping the framing envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLine {
    pub line_number: Option<u32>,
    pub command: String,
}

/// Validate and strip the framing envelope. Unframed lines pass through unchanged.
pub fn decode_framed(raw: &str) -> Result<DecodedLine, CodecError> {
    let raw = raw.trim_end_matches(['\r', '\n']);
    let star = raw.rfind('*');
    let numbered = raw.starts_with('N');

    match (numbered, star) {
        (false, None) => Ok(DecodedLine {
            line_number: None,
            command: raw.trim().to_string(),
        }),
        (false, Some(_)) => Err(CodecError::MissingLineNumber(raw.to_string())),
        (true, None) => Err(CodecError::MissingChecksum(raw.to_string())),
        (true, Some(star)) => {
            let body = &raw[..star];
            let actual: u8 = raw[star + 1..]
                .trim()
                .parse()
                .map_err(|_| CodecError::BadChecksum(raw.to_string()))?;
            let expected = checksum(body.as_bytes());
            if expected != actual {
                return Err(CodecError::ChecksumMismatch { expected, actual });
            }
            let (number, command) = match body[1..].split_once(' ') {
                Some((n, rest)) => (n, rest),
                None => (&body[1..], ""),
            };
            let line_number = number
                .parse()
                .map_err(|_| CodecError::BadLineNumber(raw.to_string()))?;
            Ok(DecodedLine {
                line_number: Some(line_number),
                command: command.trim().to_string(),
            })
        }
    }
}

/// Latest-known heater readings, all in degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Temperatures {
    pub hotend: f64,
    pub hotend_target: f64,
    pub bed: f64,
    pub bed_target: f64,
}

/// One parsed inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum AckEvent {
    Ok,
    OkWithTemperature(Temperatures),
    Busy,
    Error(String),
    Unrecognized(String),
}

impl AckEvent {
    /// Ok and OkWithTemperature release the command slot.
    pub fn is_ack(&self) -> bool {
        matches!(self, AckEvent::Ok | AckEvent::OkWithTemperature(_))
    }

    pub fn temperatures(&self) -> Option<Temperatures> {
        match self {
            AckEvent::OkWithTemperature(t) => Some(*t),
            _ => None,
        }
    }
}

/// Classify a single inbound line.
///
/// `Error` is matched case-sensitively anywhere in the line; busy notices must never
/// be confused with an acknowledgment.
pub fn parse_response(line: &str) -> AckEvent {
    let line = line.trim();
    if line.starts_with("echo:busy:") {
        return AckEvent::Busy;
    }
    if line.contains("Error") {
        let reason = line
            .split_once("Error:")
            .map(|(_, r)| r.trim())
            .filter(|r| !r.is_empty())
            .unwrap_or(line);
        return AckEvent::Error(reason.to_string());
    }
    if line == "ok" {
        return AckEvent::Ok;
    }
    if let Some(rest) = line.strip_prefix("ok") {
        if rest.starts_with(char::is_whitespace) {
            return match parse_temperatures(rest) {
                Some(t) => AckEvent::OkWithTemperature(t),
                None => AckEvent::Ok,
            };
        }
    }
    AckEvent::Unrecognized(line.to_string())
}

/// Parse `T:<f>/<f> B:<f>/<f>` (whitespace around `/` tolerated) out of a report line.
pub fn parse_temperatures(line: &str) -> Option<Temperatures> {
    let (hotend, hotend_target) = heater_pair(line, "T:")?;
    let (bed, bed_target) = heater_pair(line, "B:").unwrap_or((0.0, 0.0));
    Some(Temperatures {
        hotend,
        hotend_target,
        bed,
        bed_target,
    })
}

fn heater_pair(line: &str, key: &str) -> Option<(f64, f64)> {
    let start = line
        .match_indices(key)
        .find(|(i, _)| *i == 0 || line.as_bytes()[i - 1] == b' ')
        .map(|(i, _)| i + key.len())?;
    let rest = line[start..].trim_start();
    let (current, rest) = take_number(rest)?;
    let rest = rest.trim_start();
    let target = match rest.strip_prefix('/') {
        Some(r) => take_number(r.trim_start()).map(|(t, _)| t).unwrap_or(0.0),
        None => 0.0,
    };
    Some((current, target))
}

fn take_number(s: &str) -> Option<(f64, &str)> {
    let end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .unwrap_or(s.len());
    let value = s[..end].parse().ok()?;
    Some((value, &s[end..]))
}
