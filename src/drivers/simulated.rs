//! In-process stand-ins for the radar and the ultrasonic sensor.
//!
//! Both speak the same bytes as the hardware, so everything above the transport
//! (protocol, loop, session) runs unchanged against them. Used by the tests and by
//! `--simulate` playback.

use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::drivers::protocol::{
    self, DetectionResult, DeviceConfiguration, Opcode, STATUS_OK,
};
use crate::drivers::transport::{Link, SerialTransport};
use crate::drivers::RadarError;

/// Status the scripted radar reports once it has no responses left.
pub const SCRIPT_EXHAUSTED: u8 = 0xEE;

/// Shared record of every opcode the simulated radar received, in order.
pub type CommandLog = Arc<Mutex<Vec<Opcode>>>;

/// Called with the 1-based detection number before each detection is answered.
pub type DetectionHook = Box<dyn FnMut(u64) + Send>;

fn closed_error() -> RadarError {
    RadarError::Io(std::io::Error::new(
        ErrorKind::BrokenPipe,
        "simulated port closed",
    ))
}

enum Feed {
    Scripted(VecDeque<DetectionResult>),
    Synthetic { rng: StdRng, sweeps: u64 },
}

pub struct SimulatedRadar {
    link: Link,
    feed: Feed,
    config: DeviceConfiguration,
    failures: HashMap<Opcode, u8>,
    latency: Duration,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
    log: CommandLog,
    on_detection: Option<DetectionHook>,
    detections: u64,
    closed: bool,
}

impl SimulatedRadar {
    fn with_feed(feed: Feed) -> Self {
        Self {
            link: Link::Usb,
            feed,
            config: DeviceConfiguration::default(),
            failures: HashMap::new(),
            latency: Duration::ZERO,
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            log: Arc::new(Mutex::new(Vec::new())),
            on_detection: None,
            detections: 0,
            closed: false,
        }
    }

    /// Answers detections from `responses` in order, then reports [`SCRIPT_EXHAUSTED`].
    pub fn scripted(responses: impl IntoIterator<Item = DetectionResult>) -> Self {
        Self::with_feed(Feed::Scripted(responses.into_iter().collect()))
    }

    /// Endless random scene: up to `Ntar` targets with descending SNR and a slowly
    /// drifting phase, as a breathing subject in front of the radar would produce.
    pub fn synthetic(seed: u64) -> Self {
        Self::with_feed(Feed::Synthetic {
            rng: StdRng::seed_from_u64(seed),
            sweeps: 0,
        })
    }

    pub fn with_link(mut self, link: Link) -> Self {
        self.link = link;
        self
    }

    /// Round-trip time added to every detection.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes `opcode` answer with a non-zero `status`.
    pub fn failing(mut self, opcode: Opcode, status: u8) -> Self {
        self.failures.insert(opcode, status);
        self
    }

    /// Runs `hook` on the caller's thread each time a detection request arrives.
    pub fn on_detection(mut self, hook: impl FnMut(u64) + Send + 'static) -> Self {
        self.on_detection = Some(Box::new(hook));
        self
    }

    pub fn command_log(&self) -> CommandLog {
        Arc::clone(&self.log)
    }

    fn respond(&mut self, opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        if let Ok(mut log) = self.log.lock() {
            log.push(opcode);
        }
        if let Some(&status) = self.failures.get(&opcode) {
            return match opcode {
                Opcode::Detection => {
                    protocol::encode_detection(&self.config, status, &DetectionResult::default())
                }
                _ => protocol::encode_status(opcode, status),
            };
        }
        match opcode {
            Opcode::TurnOn | Opcode::TurnOff => protocol::encode_status(opcode, STATUS_OK),
            Opcode::LoadConfiguration => match DeviceConfiguration::from_payload(payload) {
                Ok(config) => {
                    self.config = config;
                    protocol::encode_status(opcode, STATUS_OK)
                }
                Err(_) => protocol::encode_status(opcode, 1),
            },
            Opcode::Detection => {
                self.detections += 1;
                if let Some(hook) = self.on_detection.as_mut() {
                    hook(self.detections);
                }
                if !self.latency.is_zero() {
                    std::thread::sleep(self.latency);
                }
                match self.next_detection() {
                    Some(result) => protocol::encode_detection(&self.config, STATUS_OK, &result),
                    None => protocol::encode_detection(
                        &self.config,
                        SCRIPT_EXHAUSTED,
                        &DetectionResult::default(),
                    ),
                }
            }
        }
    }

    fn next_detection(&mut self) -> Option<DetectionResult> {
        match &mut self.feed {
            Feed::Scripted(queue) => queue.pop_front(),
            Feed::Synthetic { rng, sweeps } => {
                *sweeps += 1;
                Some(synthesize(&self.config, rng, *sweeps))
            }
        }
    }
}

fn synthesize(config: &DeviceConfiguration, rng: &mut StdRng, sweep: u64) -> DetectionResult {
    let ns = config.ns();
    let count = rng.gen_range(0..=config.ntar());
    let mut snr: Vec<f32> = (0..count).map(|_| rng.gen_range(-3.0..25.0)).collect();
    snr.sort_by(|a, b| b.total_cmp(a));
    let distances: Vec<f32> = (0..count)
        .map(|_| rng.gen_range(0.5..f32::from(config.max_range)))
        .collect();

    // ~0.25 Hz chest motion at the device's ~20 sweeps per second
    let t = sweep as f64 / 20.0;
    let drift = 0.8 * (2.0 * PI * 0.25 * t).sin();

    let mut i = vec![0.0f64; ns];
    let mut q = vec![0.0f64; ns];
    for (&d, &s) in distances.iter().zip(&snr) {
        let bin = (f64::from(d) / f64::from(config.max_range) * (ns / 2) as f64).round();
        let amplitude = 40.0 * f64::from(s.max(0.0));
        for n in 0..ns {
            let arg = 2.0 * PI * bin * n as f64 / ns as f64 + drift;
            i[n] += amplitude * arg.cos();
            q[n] += amplitude * arg.sin();
        }
    }
    let mut quantize = |v: f64| -> u16 {
        let noisy = 2048.0 + v + rng.gen_range(-4.0..4.0);
        noisy.round().clamp(0.0, 4095.0) as u16
    };
    let i: Vec<u16> = i.into_iter().map(&mut quantize).collect();
    let q: Vec<u16> = q.into_iter().map(&mut quantize).collect();

    DetectionResult {
        target_count: count,
        distances: if config.channels.distance { distances } else { Vec::new() },
        velocities: if config.channels.velocity { vec![0.0; count] } else { Vec::new() },
        snr: if config.channels.snr { snr } else { Vec::new() },
        i,
        q,
        movement: false,
    }
}

impl SerialTransport for SimulatedRadar {
    fn link(&self) -> Link {
        self.link
    }

    fn read_line(&mut self, _timeout: Duration) -> Result<Vec<u8>, RadarError> {
        if self.closed {
            return Err(closed_error());
        }
        match self.outbound.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let mut line: Vec<u8> = self.outbound.drain(..=pos).collect();
                line.pop();
                Ok(line)
            }
            None => Ok(Vec::new()),
        }
    }

    fn read_exact(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, RadarError> {
        if self.closed {
            return Err(closed_error());
        }
        let n = buf.len().min(self.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), RadarError> {
        if self.closed {
            return Err(closed_error());
        }
        self.inbound.extend_from_slice(bytes);
        loop {
            match protocol::decode_request(&self.inbound) {
                Ok(Some((opcode, payload, used))) => {
                    self.inbound.drain(..used);
                    let reply = self.respond(opcode, &payload);
                    self.outbound.extend(reply);
                }
                Ok(None) => return Ok(()),
                Err(err) => {
                    warn!("simulated radar dropped garbage: {err}");
                    self.inbound.clear();
                    return Ok(());
                }
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Line-oriented stand-in for the ultrasonic rangefinder.
pub struct SimulatedUltrasonic {
    lines: VecDeque<Vec<u8>>,
    synthetic: Option<StdRng>,
    interval: Duration,
    closed: Arc<AtomicBool>,
}

impl SimulatedUltrasonic {
    /// Replays `lines` verbatim, then behaves like a silent sensor (read timeouts).
    pub fn scripted<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            synthetic: None,
            interval: Duration::from_millis(5),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Emits a noisy distance around 100 cm every 100 ms.
    pub fn synthetic(seed: u64) -> Self {
        Self {
            lines: VecDeque::new(),
            synthetic: Some(StdRng::seed_from_u64(seed)),
            interval: Duration::from_millis(100),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Becomes `true` once the owner closes the port.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

impl SerialTransport for SimulatedUltrasonic {
    fn link(&self) -> Link {
        Link::Uart
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Vec<u8>, RadarError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        if let Some(line) = self.lines.pop_front() {
            return Ok(line);
        }
        std::thread::sleep(self.interval.min(timeout));
        match &mut self.synthetic {
            Some(rng) => {
                let distance: f64 = 100.0 + rng.gen_range(-2.5..2.5);
                Ok(format!("{distance:.2}\r").into_bytes())
            }
            None => Ok(Vec::new()),
        }
    }

    fn read_exact(&mut self, _buf: &mut [u8], timeout: Duration) -> Result<usize, RadarError> {
        std::thread::sleep(self.interval.min(timeout));
        Ok(0)
    }

    fn write(&mut self, _bytes: &[u8]) -> Result<(), RadarError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_scene_respects_configuration() {
        let config = DeviceConfiguration::default();
        let mut rng = StdRng::seed_from_u64(7);
        for sweep in 0..50 {
            let result = synthesize(&config, &mut rng, sweep);
            assert!(result.target_count <= config.ntar());
            assert_eq!(result.snr.len(), result.target_count);
            assert_eq!(result.i.len(), config.ns());
            assert_eq!(result.q.len(), config.ns());
            assert!(result.snr.windows(2).all(|w| w[0] >= w[1]));
            assert!(result.i.iter().all(|&v| v < 4096));
        }
    }

    #[test]
    fn closed_radar_refuses_writes() {
        let mut radar = SimulatedRadar::scripted(Vec::new());
        radar.close();
        assert!(radar.write(&[0x10, 0, 0x10]).is_err());
    }

    #[test]
    fn scripted_ultrasonic_goes_quiet_when_exhausted() {
        let mut sensor = SimulatedUltrasonic::scripted(["12.5"]);
        let timeout = Duration::from_millis(10);
        assert_eq!(sensor.read_line(timeout).unwrap(), b"12.5".to_vec());
        assert!(sensor.read_line(timeout).unwrap().is_empty());
    }
}
