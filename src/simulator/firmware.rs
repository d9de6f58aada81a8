// src/simulator/firmware.rs - Line-in/line-out firmware model for tests and the harness
//! A synchronous model of a printer controller. Each inbound line produces the response
//! lines a real board would print, plus timing hints for the transport that carries them.
//! The busy and leveling grammars here are the contract the host is tested against.

use crate::communication::codec::{self, CodecError};
use crate::firmware::Dialect;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const AMBIENT: f64 = 22.0;
/// Simulated seconds that pass per handled command.
const COMMAND_DT: f64 = 0.5;
const MAX_WAIT_REPORTS: usize = 600;

/// Commands that never count towards a fault trigger's ordinal.
const HOUSEKEEPING: [&str; 3] = ["M105", "M110", "M115"];

#[derive(Debug, Clone, PartialEq)]
pub enum FaultTrigger {
    /// The n-th (1-based) non-housekeeping command accepted by the firmware.
    AtCommand(usize),
    /// First command whose text matches exactly.
    OnCommand(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FaultAction {
    /// Reply with an `Error:` line instead of executing.
    Error(String),
    /// Swallow the line silently this many times.
    Drop(u32),
    /// Hold the reply back.
    Stall(Duration),
    /// Emit this many busy notices before the ack.
    Busy(u32),
    /// The device vanishes from the bus.
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaultRule {
    pub trigger: FaultTrigger,
    pub action: FaultAction,
    spent: bool,
}

/// Scripted misbehaviour. Shared between every firmware instance behind one port so a
/// rule that already fired stays spent across reconnects.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    rules: Vec<FaultRule>,
    pub response_delay: Duration,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, trigger: FaultTrigger, action: FaultAction) -> Self {
        self.rules.push(FaultRule {
            trigger,
            action,
            spent: false,
        });
        self
    }

    pub fn error_at(self, n: usize, reason: &str) -> Self {
        self.rule(FaultTrigger::AtCommand(n), FaultAction::Error(reason.to_string()))
    }

    pub fn drop_at(self, n: usize, times: u32) -> Self {
        self.rule(FaultTrigger::AtCommand(n), FaultAction::Drop(times))
    }

    pub fn stall_at(self, n: usize, delay: Duration) -> Self {
        self.rule(FaultTrigger::AtCommand(n), FaultAction::Stall(delay))
    }

    pub fn busy_at(self, n: usize, notices: u32) -> Self {
        self.rule(FaultTrigger::AtCommand(n), FaultAction::Busy(notices))
    }

    pub fn disconnect_at(self, n: usize) -> Self {
        self.rule(FaultTrigger::AtCommand(n), FaultAction::Disconnect)
    }

    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    /// Find the live rule for this command and consume one use of it.
    fn take(&mut self, ordinal: Option<usize>, command: &str) -> Option<FaultAction> {
        let rule = self.rules.iter_mut().find(|r| {
            !r.spent
                && match &r.trigger {
                    FaultTrigger::AtCommand(n) => ordinal == Some(*n),
                    FaultTrigger::OnCommand(text) => text == command,
                }
        })?;
        match &mut rule.action {
            FaultAction::Drop(times) if *times > 1 => {
                *times -= 1;
                Some(FaultAction::Drop(1))
            }
            action => {
                rule.spent = true;
                Some(action.clone())
            }
        }
    }
}

/// What the transport should do with one handled line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FirmwareOutput {
    pub lines: Vec<String>,
    pub delay: Duration,
    pub disconnect: bool,
}

impl FirmwareOutput {
    fn lines(lines: Vec<String>) -> Self {
        Self {
            lines,
            ..Default::default()
        }
    }

    fn ok() -> Self {
        Self::lines(vec!["ok".to_string()])
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimHeater {
    pub current: f64,
    pub target: f64,
    pub heat_rate: f64,
}

impl SimHeater {
    fn new(heat_rate: f64) -> Self {
        Self {
            current: AMBIENT,
            target: 0.0,
            heat_rate,
        }
    }

    pub fn update(&mut self, dt: f64, ambient: f64) {
        if self.target > self.current {
            self.current = (self.current + self.heat_rate * dt).min(self.target);
        } else {
            let floor = self.target.max(ambient);
            let heat_loss = 0.1 * (self.current - ambient) * dt;
            self.current = (self.current - heat_loss.max(0.0)).max(floor);
        }
    }

    fn settled(&self) -> bool {
        self.target <= 0.0 || (self.current - self.target).abs() < 1.0
    }
}

/// Read-only view for assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct FirmwareSnapshot {
    pub dialect: Dialect,
    pub hotend: SimHeater,
    pub bed: SimHeater,
    pub position: [f64; 4],
    pub homed: bool,
    pub fan_speed: u8,
    pub paused: bool,
    pub killed: bool,
    pub last_line_number: u32,
    /// Commands executed, in order, without framing. Duplicates of an already
    /// executed line number are not repeated here.
    pub executed: Vec<String>,
    /// Every raw line that reached the firmware, framing included.
    pub raw_lines: Vec<String>,
}

pub struct SimulatedFirmware {
    dialect: Dialect,
    hotend: SimHeater,
    bed: SimHeater,
    position: [f64; 4],
    relative: bool,
    homed: bool,
    fan_speed: u8,
    paused: bool,
    killed: bool,
    last_line: u32,
    accepted: usize,
    faults: Arc<Mutex<FaultPlan>>,
    executed: Vec<String>,
    raw_lines: Vec<String>,
    noise: Option<StdRng>,
}

impl SimulatedFirmware {
    pub fn new(dialect: Dialect) -> Self {
        Self::with_faults(dialect, Arc::new(Mutex::new(FaultPlan::default())))
    }

    pub fn with_faults(dialect: Dialect, faults: Arc<Mutex<FaultPlan>>) -> Self {
        Self {
            dialect,
            hotend: SimHeater::new(8.0),
            bed: SimHeater::new(2.0),
            position: [0.0; 4],
            relative: false,
            homed: false,
            fan_speed: 0,
            paused: false,
            killed: false,
            last_line: 0,
            accepted: 0,
            faults,
            executed: Vec::new(),
            raw_lines: Vec::new(),
            noise: None,
        }
    }

    /// Add sensor noise to temperature reports. Seeded so runs stay reproducible.
    pub fn with_noise(mut self, seed: u64) -> Self {
        self.noise = Some(StdRng::seed_from_u64(seed));
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Lines a freshly reset board prints before it accepts commands.
    pub fn boot_banner(&self) -> Vec<String> {
        match self.dialect {
            Dialect::GenericMarlin => vec![
                "start".to_string(),
                "echo:Marlin 2.1.2.1".to_string(),
                "echo: Last Updated: 2023-06-20 | Author: (simulated)".to_string(),
            ],
            Dialect::Prusa => vec!["start".to_string(), "echo: 3.13.2-7080".to_string()],
            Dialect::Klipper => vec!["// Klipper state: Ready".to_string()],
            Dialect::Unknown => vec![],
        }
    }

    pub fn identification(&self) -> Vec<String> {
        match self.dialect {
            Dialect::GenericMarlin => vec![
                "FIRMWARE_NAME:Marlin 2.1.2.1 (Jun 20 2023) SOURCE_CODE_URL:github.com/MarlinFirmware/Marlin PROTOCOL_VERSION:1.0 MACHINE_TYPE:Simulated Printer EXTRUDER_COUNT:1".to_string(),
                "Cap:AUTOREPORT_TEMP:1".to_string(),
                "Cap:EMERGENCY_PARSER:1".to_string(),
                "Cap:HOST_ACTION_COMMANDS:1".to_string(),
            ],
            Dialect::Prusa => vec![
                "FIRMWARE_NAME:Prusa-Firmware 3.13.2 based on Marlin FIRMWARE_URL:https://github.com/prusa3d/Prusa-Firmware PROTOCOL_VERSION:1.0 MACHINE_TYPE:Prusa i3 MK3S EXTRUDER_COUNT:1".to_string(),
                "Cap:AUTOREPORT_TEMP:1".to_string(),
            ],
            Dialect::Klipper => {
                vec!["FIRMWARE_NAME:Klipper FIRMWARE_VERSION:v0.12.0-simulated".to_string()]
            }
            Dialect::Unknown => vec!["SimCNC 0.3 ready".to_string()],
        }
    }

    pub fn snapshot(&self) -> FirmwareSnapshot {
        FirmwareSnapshot {
            dialect: self.dialect,
            hotend: self.hotend,
            bed: self.bed,
            position: self.position,
            homed: self.homed,
            fan_speed: self.fan_speed,
            paused: self.paused,
            killed: self.killed,
            last_line_number: self.last_line,
            executed: self.executed.clone(),
            raw_lines: self.raw_lines.clone(),
        }
    }

    /// Handle one inbound line.
    pub fn handle_line(&mut self, raw: &str) -> FirmwareOutput {
        // Blank lines are ignored outright, as real boards do
        if raw.trim().is_empty() {
            return FirmwareOutput::default();
        }
        self.raw_lines.push(raw.to_string());

        let decoded = match codec::decode_framed(raw) {
            Ok(d) => d,
            Err(e) => return self.framing_error(&e),
        };
        let command = decoded.command;

        if let Some(n) = decoded.line_number {
            if is_command(&command, "M110") {
                self.last_line = word_value(&command, 'N').map(|v| v as u32).unwrap_or(n);
                return FirmwareOutput::ok();
            }
            if n == self.last_line && !self.executed.is_empty() {
                // Resend of a line we already executed; the ack was lost.
                return FirmwareOutput::ok();
            }
            if n != self.last_line + 1 {
                return self.resend_request(&format!(
                    "Line Number is not Last Line Number+1, Last Line: {}",
                    self.last_line
                ));
            }
        }

        let housekeeping = HOUSEKEEPING.iter().any(|h| is_command(&command, h));
        let ordinal = if housekeeping { None } else { Some(self.accepted + 1) };
        let (fault, response_delay) = {
            let mut plan = self.faults.lock().unwrap_or_else(|e| e.into_inner());
            (plan.take(ordinal, &command), plan.response_delay)
        };

        if matches!(fault, Some(FaultAction::Drop(_))) {
            return FirmwareOutput::default();
        }
        if matches!(fault, Some(FaultAction::Disconnect)) {
            return FirmwareOutput {
                disconnect: true,
                ..Default::default()
            };
        }

        if let Some(n) = decoded.line_number {
            self.last_line = n;
        }
        if !housekeeping {
            self.accepted += 1;
        }

        let mut output = match fault {
            Some(FaultAction::Error(reason)) => FirmwareOutput::lines(vec![
                format!("Error:{}", reason),
                "ok".to_string(),
            ]),
            _ => {
                self.executed.push(command.clone());
                self.execute(&command)
            }
        };

        match fault {
            Some(FaultAction::Stall(delay)) => output.delay += delay,
            Some(FaultAction::Busy(notices)) => {
                let mut lines: Vec<String> =
                    (0..notices).map(|_| "echo:busy: processing".to_string()).collect();
                lines.append(&mut output.lines);
                output.lines = lines;
            }
            _ => {}
        }
        output.delay += response_delay;
        output
    }

    fn framing_error(&self, error: &CodecError) -> FirmwareOutput {
        let reason = match error {
            CodecError::ChecksumMismatch { .. } => "checksum mismatch",
            CodecError::MissingChecksum(_) => "No Checksum with line number",
            CodecError::MissingLineNumber(_) => "No Line Number with checksum",
            CodecError::BadLineNumber(_) | CodecError::BadChecksum(_) => "Malformed line",
        };
        self.resend_request(&format!("{}, Last Line: {}", reason, self.last_line))
    }

    fn resend_request(&self, reason: &str) -> FirmwareOutput {
        FirmwareOutput::lines(vec![
            format!("Error:{}", reason),
            format!("Resend: {}", self.last_line + 1),
            "ok".to_string(),
        ])
    }

    fn tick(&mut self, dt: f64) {
        self.hotend.update(dt, AMBIENT);
        self.bed.update(dt, AMBIENT);
    }

    fn temperature_report(&mut self) -> String {
        let (mut t, mut b) = (self.hotend.current, self.bed.current);
        if let Some(rng) = self.noise.as_mut() {
            t += rng.random_range(-0.3..0.3);
            b += rng.random_range(-0.3..0.3);
        }
        format!(
            "T:{:.1} /{:.1} B:{:.1} /{:.1} @:0 B@:0",
            t, self.hotend.target, b, self.bed.target
        )
    }

    fn busy_notice(&self) -> Option<String> {
        match self.dialect {
            Dialect::GenericMarlin | Dialect::Prusa => Some("echo:busy: processing".to_string()),
            Dialect::Klipper | Dialect::Unknown => None,
        }
    }

    fn execute(&mut self, command: &str) -> FirmwareOutput {
        self.tick(COMMAND_DT);
        let word = command
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        let profile = self.dialect.profile();

        if word.is_empty() {
            return FirmwareOutput::ok();
        }

        if self.killed && !matches!(word.as_str(), "M104" | "M140" | "M105" | "M110" | "M115" | "M999") {
            return FirmwareOutput::lines(vec![
                "Error:Printer halted. kill() called!".to_string(),
                "ok".to_string(),
            ]);
        }

        if word == profile.stop_command {
            self.killed = true;
            self.hotend.target = 0.0;
            self.bed.target = 0.0;
            return FirmwareOutput::lines(vec!["echo:Emergency stop, heaters off".to_string()]);
        }
        if profile.pause_command == Some(word.as_str()) {
            self.paused = true;
            return FirmwareOutput::lines(vec!["// action:paused".to_string(), "ok".to_string()]);
        }
        if profile.resume_command == Some(word.as_str()) {
            self.paused = false;
            return FirmwareOutput::lines(vec!["// action:resumed".to_string(), "ok".to_string()]);
        }
        if profile.leveling_command == Some(word.as_str()) {
            return self.level_bed();
        }

        match word.as_str() {
            "M115" => {
                let mut lines = self.identification();
                lines.push("ok".to_string());
                FirmwareOutput::lines(lines)
            }
            "M105" => FirmwareOutput::lines(vec![format!("ok {}", self.temperature_report())]),
            "M104" => {
                self.hotend.target = word_value(command, 'S').unwrap_or(0.0);
                FirmwareOutput::ok()
            }
            "M140" => {
                self.bed.target = word_value(command, 'S').unwrap_or(0.0);
                FirmwareOutput::ok()
            }
            "M109" | "M190" => {
                let target = word_value(command, 'S').unwrap_or(0.0);
                if word == "M109" {
                    self.hotend.target = target;
                } else {
                    self.bed.target = target;
                }
                let mut lines = Vec::new();
                for _ in 0..MAX_WAIT_REPORTS {
                    let heater = if word == "M109" { &self.hotend } else { &self.bed };
                    if heater.settled() {
                        break;
                    }
                    self.tick(1.0);
                    lines.push(self.temperature_report());
                }
                lines.push("ok".to_string());
                FirmwareOutput::lines(lines)
            }
            "G28" => {
                self.position = [0.0, 0.0, 0.0, self.position[3]];
                self.homed = true;
                let mut lines: Vec<String> = self.busy_notice().into_iter().collect();
                lines.push("ok".to_string());
                FirmwareOutput::lines(lines)
            }
            "G0" | "G1" => {
                for (i, axis) in ['X', 'Y', 'Z', 'E'].into_iter().enumerate() {
                    if let Some(v) = word_value(command, axis) {
                        self.position[i] = if self.relative { self.position[i] + v } else { v };
                    }
                }
                FirmwareOutput::ok()
            }
            "G90" => {
                self.relative = false;
                FirmwareOutput::ok()
            }
            "G91" => {
                self.relative = true;
                FirmwareOutput::ok()
            }
            "G92" => {
                for (i, axis) in ['X', 'Y', 'Z', 'E'].into_iter().enumerate() {
                    if let Some(v) = word_value(command, axis) {
                        self.position[i] = v;
                    }
                }
                FirmwareOutput::ok()
            }
            "M114" => FirmwareOutput::lines(vec![
                format!(
                    "X:{:.2} Y:{:.2} Z:{:.2} E:{:.2} Count X:0 Y:0 Z:0",
                    self.position[0], self.position[1], self.position[2], self.position[3]
                ),
                "ok".to_string(),
            ]),
            "M106" => {
                self.fan_speed = word_value(command, 'S').unwrap_or(255.0).clamp(0.0, 255.0) as u8;
                FirmwareOutput::ok()
            }
            "M107" => {
                self.fan_speed = 0;
                FirmwareOutput::ok()
            }
            "M110" => {
                self.last_line = word_value(command, 'N').map(|v| v as u32).unwrap_or(0);
                FirmwareOutput::ok()
            }
            "M999" => {
                self.killed = false;
                FirmwareOutput::ok()
            }
            "M82" | "M83" | "M84" | "M73" | "M117" | "M400" | "G4" | "G21" => FirmwareOutput::ok(),
            _ => {
                let notice = match self.dialect {
                    Dialect::Klipper => format!("// Unknown command:\"{}\"", word),
                    _ => format!("echo:Unknown command: \"{}\"", command),
                };
                FirmwareOutput::lines(vec![notice, "ok".to_string()])
            }
        }
    }

    /// Multi-line probing sequence: busy notices, a height grid, then the ack.
    fn level_bed(&mut self) -> FirmwareOutput {
        let grid = [[0.012, -0.004, 0.021], [0.008, 0.000, -0.011], [-0.015, 0.006, 0.018]];
        let mut lines = Vec::new();
        match self.dialect {
            Dialect::Klipper => {
                for (y, row) in grid.iter().enumerate() {
                    for (x, z) in row.iter().enumerate() {
                        lines.push(format!(
                            "// probe at {:.3},{:.3} is z={:.6}",
                            10.0 + 100.0 * x as f64,
                            10.0 + 100.0 * y as f64,
                            z
                        ));
                    }
                }
                lines.push("// Mesh Bed Leveling Complete".to_string());
            }
            _ => {
                for _ in 0..3 {
                    lines.push("echo:busy: processing".to_string());
                }
                lines.push("Bilinear Leveling Grid:".to_string());
                lines.push("      0      1      2".to_string());
                for (y, row) in grid.iter().enumerate() {
                    let cells: Vec<String> = row.iter().map(|z| format!("{:+.3}", z)).collect();
                    lines.push(format!(" {} {}", y, cells.join(" ")));
                }
            }
        }
        lines.push("ok".to_string());
        FirmwareOutput::lines(lines)
    }
}

fn is_command(command: &str, word: &str) -> bool {
    command
        .split_whitespace()
        .next()
        .is_some_and(|w| w.eq_ignore_ascii_case(word))
}

/// Numeric value of a parameter word such as `S200` or `X10.5`.
fn word_value(command: &str, letter: char) -> Option<f64> {
    command
        .split_whitespace()
        .skip(1)
        .find_map(|w| {
            let mut chars = w.chars();
            let first = chars.next()?;
            if first.eq_ignore_ascii_case(&letter) {
                chars.as_str().parse().ok()
            } else {
                None
            }
        })
}
