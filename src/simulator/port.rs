// src/simulator/port.rs - Simulated serial bus: ports, baud matching, hot-plug
use crate::communication::transport::{ConnectionError, PortOpener, Transport};
use crate::firmware::Dialect;
use crate::simulator::firmware::{FaultPlan, FirmwareSnapshot, SimulatedFirmware};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A printer attached to the simulated bus.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub port: String,
    pub dialect: Dialect,
    /// The only rate at which the device answers intelligibly.
    pub baud: u32,
    pub faults: FaultPlan,
    /// Come back on the bus this long after a scripted disconnect.
    pub auto_replug: Option<Duration>,
    pub noise_seed: Option<u64>,
}

impl SimulatedDevice {
    pub fn new(port: &str, dialect: Dialect, baud: u32) -> Self {
        Self {
            port: port.to_string(),
            dialect,
            baud,
            faults: FaultPlan::default(),
            auto_replug: None,
            noise_seed: None,
        }
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_auto_replug(mut self, after: Duration) -> Self {
        self.auto_replug = Some(after);
        self
    }

    pub fn with_noise(mut self, seed: u64) -> Self {
        self.noise_seed = Some(seed);
        self
    }
}

struct DeviceSlot {
    device: SimulatedDevice,
    faults: Arc<Mutex<FaultPlan>>,
    plugged: bool,
    generation: u64,
    opens: u32,
    firmware: Option<Arc<Mutex<SimulatedFirmware>>>,
}

#[derive(Default)]
struct Registry {
    devices: BTreeMap<String, DeviceSlot>,
    /// Ports that open fine but have nothing listening.
    silent: Vec<String>,
}

impl Registry {
    fn link_ok(&self, port: &str, generation: u64) -> bool {
        match self.devices.get(port) {
            Some(slot) => slot.plugged && slot.generation == generation,
            None => self.silent.iter().any(|p| p == port),
        }
    }
}

/// In-memory serial bus. Cloning shares the same bus.
#[derive(Clone, Default)]
pub struct SimulatedPorts {
    inner: Arc<Mutex<Registry>>,
}

impl SimulatedPorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus with a single device on it.
    pub fn single(port: &str, dialect: Dialect, baud: u32) -> Self {
        let ports = Self::new();
        ports.attach(SimulatedDevice::new(port, dialect, baud));
        ports
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn attach(&self, device: SimulatedDevice) {
        let faults = Arc::new(Mutex::new(device.faults.clone()));
        self.registry().devices.insert(
            device.port.clone(),
            DeviceSlot {
                device,
                faults,
                plugged: true,
                generation: 0,
                opens: 0,
                firmware: None,
            },
        );
    }

    pub fn add_silent_port(&self, port: &str) {
        self.registry().silent.push(port.to_string());
    }

    /// Pull the cable. Open transports start failing with I/O errors.
    pub fn unplug(&self, port: &str) {
        unplug(&self.inner, port);
    }

    pub fn replug(&self, port: &str) {
        if let Some(slot) = self.registry().devices.get_mut(port) {
            slot.plugged = true;
            tracing::info!("Simulated device {} plugged in", port);
        }
    }

    pub fn is_plugged(&self, port: &str) -> bool {
        self.registry()
            .devices
            .get(port)
            .is_some_and(|slot| slot.plugged)
    }

    /// How many times the port has been opened at any baud.
    pub fn open_count(&self, port: &str) -> u32 {
        self.registry().devices.get(port).map_or(0, |slot| slot.opens)
    }

    /// State of the firmware behind the most recent intelligible open of `port`.
    pub fn snapshot(&self, port: &str) -> Option<FirmwareSnapshot> {
        let firmware = self.registry().devices.get(port)?.firmware.clone()?;
        let fw = firmware.lock().unwrap_or_else(|e| e.into_inner());
        Some(fw.snapshot())
    }
}

fn unplug(registry: &Arc<Mutex<Registry>>, port: &str) {
    let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(slot) = registry.devices.get_mut(port) {
        if slot.plugged {
            slot.plugged = false;
            slot.generation += 1;
            tracing::info!("Simulated device {} unplugged", port);
        }
    }
}

#[async_trait]
impl PortOpener for SimulatedPorts {
    fn available_ports(&self) -> Vec<String> {
        let registry = self.registry();
        let mut ports: Vec<String> = registry
            .devices
            .iter()
            .filter(|(_, slot)| slot.plugged)
            .map(|(name, _)| name.clone())
            .chain(registry.silent.iter().cloned())
            .collect();
        ports.sort();
        ports
    }

    async fn open(&self, port: &str, baud: u32) -> Result<Arc<dyn Transport>, ConnectionError> {
        let mut registry = self.registry();
        if registry.silent.iter().any(|p| p == port) {
            return Ok(Arc::new(SimulatedTransport::new(
                port,
                baud,
                self.inner.clone(),
                0,
                Responder::Silent,
                None,
            )));
        }

        let slot = registry
            .devices
            .get_mut(port)
            .filter(|slot| slot.plugged)
            .ok_or_else(|| ConnectionError::PortNotFound(port.to_string()))?;
        slot.opens += 1;

        let responder = if baud == slot.device.baud {
            let mut fw = SimulatedFirmware::with_faults(slot.device.dialect, slot.faults.clone());
            if let Some(seed) = slot.device.noise_seed {
                fw = fw.with_noise(seed);
            }
            let fw = Arc::new(Mutex::new(fw));
            slot.firmware = Some(fw.clone());
            Responder::Firmware(fw)
        } else {
            Responder::Garbled
        };

        let transport = SimulatedTransport::new(
            port,
            baud,
            self.inner.clone(),
            slot.generation,
            responder,
            slot.device.auto_replug,
        );
        tracing::debug!("Opened simulated port {} at {} baud", port, baud);
        Ok(Arc::new(transport))
    }
}

enum Responder {
    Firmware(Arc<Mutex<SimulatedFirmware>>),
    /// Wrong baud rate: every write produces line noise.
    Garbled,
    Silent,
}

/// Transport half of the simulated bus. Responses become readable once their delay elapses.
pub struct SimulatedTransport {
    name: String,
    baud: u32,
    registry: Arc<Mutex<Registry>>,
    generation: u64,
    responder: Responder,
    auto_replug: Option<Duration>,
    outbox: Mutex<VecDeque<(Instant, String)>>,
    ready: Notify,
    closed: AtomicBool,
}

impl SimulatedTransport {
    fn new(
        name: &str,
        baud: u32,
        registry: Arc<Mutex<Registry>>,
        generation: u64,
        responder: Responder,
        auto_replug: Option<Duration>,
    ) -> Self {
        let transport = Self {
            name: name.to_string(),
            baud,
            registry,
            generation,
            responder,
            auto_replug,
            outbox: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
        };
        let banner = match &transport.responder {
            Responder::Firmware(fw) => fw.lock().unwrap_or_else(|e| e.into_inner()).boot_banner(),
            Responder::Garbled => vec![garbage(12)],
            Responder::Silent => vec![],
        };
        transport.enqueue(banner, Duration::ZERO);
        transport
    }

    fn outbox(&self) -> std::sync::MutexGuard<'_, VecDeque<(Instant, String)>> {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(&self, lines: Vec<String>, delay: Duration) {
        if lines.is_empty() {
            return;
        }
        let mut outbox = self.outbox();
        // Replies never overtake earlier ones
        let floor = outbox.back().map(|(t, _)| *t);
        let mut ready_at = Instant::now() + delay;
        if let Some(floor) = floor {
            ready_at = ready_at.max(floor);
        }
        outbox.extend(lines.into_iter().map(|line| (ready_at, line)));
        drop(outbox);
        self.ready.notify_one();
    }

    fn check_link(&self) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed(self.name.clone()));
        }
        let ok = self
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .link_ok(&self.name, self.generation);
        if ok {
            Ok(())
        } else {
            Err(ConnectionError::Io {
                port: self.name.clone(),
                reason: "device disconnected".to_string(),
            })
        }
    }

    fn disconnect(&self) {
        unplug(&self.registry, &self.name);
        self.outbox().clear();
        if let Some(after) = self.auto_replug {
            let registry = self.registry.clone();
            let port = self.name.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                if let Some(slot) = registry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .devices
                    .get_mut(&port)
                {
                    slot.plugged = true;
                    tracing::info!("Simulated device {} plugged back in", port);
                }
            });
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn baud(&self) -> u32 {
        self.baud
    }

    async fn write_line(&self, line: &str) -> Result<(), ConnectionError> {
        self.check_link()?;
        tracing::debug!("Sim TX [{}]: {}", self.name, line);
        match &self.responder {
            Responder::Firmware(fw) => {
                let output = fw.lock().unwrap_or_else(|e| e.into_inner()).handle_line(line);
                if output.disconnect {
                    self.disconnect();
                    return Ok(());
                }
                self.enqueue(output.lines, output.delay);
            }
            Responder::Garbled => self.enqueue(vec![garbage(line.len().max(4))], Duration::ZERO),
            Responder::Silent => {}
        }
        Ok(())
    }

    async fn read_line(&self, timeout: Duration) -> Result<Option<String>, ConnectionError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.check_link()?;
            let notified = self.ready.notified();
            let wake = {
                let mut outbox = self.outbox();
                match outbox.front() {
                    Some((ready_at, _)) if *ready_at <= Instant::now() => {
                        let line = outbox.pop_front().map(|(_, line)| line);
                        if let Some(line) = &line {
                            tracing::debug!("Sim RX [{}]: {}", self.name, line);
                        }
                        return Ok(line);
                    }
                    Some((ready_at, _)) => (*ready_at).min(deadline),
                    None => deadline,
                }
            };
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn clear_input(&self) -> Result<(), ConnectionError> {
        self.check_link()?;
        self.outbox().clear();
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn garbage(len: usize) -> String {
    std::iter::repeat_n('\u{fffd}', len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_right_baud_answers() {
        let ports = SimulatedPorts::single("/dev/ttyUSB0", Dialect::GenericMarlin, 115200);
        let t = ports.open("/dev/ttyUSB0", 115200).await.unwrap();
        t.clear_input().await.unwrap();
        t.write_line("M115").await.unwrap();
        let first = t.read_line(Duration::from_millis(50)).await.unwrap().unwrap();
        assert!(first.starts_with("FIRMWARE_NAME:Marlin"));
    }

    #[tokio::test]
    async fn test_wrong_baud_is_noise() {
        let ports = SimulatedPorts::single("/dev/ttyUSB0", Dialect::GenericMarlin, 115200);
        let t = ports.open("/dev/ttyUSB0", 250000).await.unwrap();
        t.clear_input().await.unwrap();
        t.write_line("M115").await.unwrap();
        let line = t.read_line(Duration::from_millis(50)).await.unwrap().unwrap();
        assert!(!crate::firmware::is_meaningful(&line));
    }

    #[tokio::test]
    async fn test_unplug_breaks_open_transport() {
        let ports = SimulatedPorts::single("/dev/ttyACM0", Dialect::Prusa, 115200);
        let t = ports.open("/dev/ttyACM0", 115200).await.unwrap();
        ports.unplug("/dev/ttyACM0");
        assert!(matches!(
            t.write_line("M105").await,
            Err(ConnectionError::Io { .. })
        ));
        assert!(ports.open("/dev/ttyACM0", 115200).await.is_err());
        assert!(ports.available_ports().is_empty());

        ports.replug("/dev/ttyACM0");
        // A new handle works; the stale one stays dead
        let fresh = ports.open("/dev/ttyACM0", 115200).await.unwrap();
        assert!(fresh.write_line("M105").await.is_ok());
        assert!(t.write_line("M105").await.is_err());
    }

    #[tokio::test]
    async fn test_delayed_reply_respects_deadline() {
        let device = SimulatedDevice::new("/dev/ttyUSB1", Dialect::GenericMarlin, 115200)
            .with_faults(FaultPlan::new().with_response_delay(Duration::from_millis(200)));
        let ports = SimulatedPorts::new();
        ports.attach(device);
        let t = ports.open("/dev/ttyUSB1", 115200).await.unwrap();
        t.clear_input().await.unwrap();
        t.write_line("G28").await.unwrap();
        assert_eq!(t.read_line(Duration::from_millis(20)).await.unwrap(), None);
        let line = t.read_line(Duration::from_millis(500)).await.unwrap();
        assert!(line.is_some());
    }
}
