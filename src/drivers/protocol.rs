//! Command frames exchanged with the radar.
//!
//! Every request is `[opcode][len][payload..][checksum]`, where the checksum is the
//! wrapping byte sum of everything before it. Responses start with [`ACK`] and echo
//! the opcode:
//!
//! | Response | Layout |
//! |---|---|
//! | status | `AA op status sum` |
//! | detection, status != 0 | `AA 13 status sum` |
//! | detection, status == 0 | `AA 13 00 count [dist f32 x count] [vel f32 x count] [snr f32 x count] [I u16 x Ns] [Q u16 x Ns] [mov u8] sum` |
//!
//! Bracketed blocks are only present when the matching channel flag was set in the
//! loaded [`DeviceConfiguration`]. All multi-byte values are little-endian.
//!
//! Functions here are pure; both the host side and the simulated device use them.
//!
//! This framing is defined by this crate, not by the uRAD firmware. Driving real
//! hardware needs this module ported to the vendor's command protocol first.

use std::fmt;

use crate::drivers::RadarError;

pub const ACK: u8 = 0xAA;
pub const STATUS_OK: u8 = 0;
/// Length of a configuration payload on the wire.
pub const CONFIG_LEN: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    TurnOn = 0x10,
    TurnOff = 0x11,
    LoadConfiguration = 0x12,
    Detection = 0x13,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x10 => Some(Opcode::TurnOn),
            0x11 => Some(Opcode::TurnOff),
            0x12 => Some(Opcode::LoadConfiguration),
            0x13 => Some(Opcode::Detection),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::TurnOn => "turn-on",
            Opcode::TurnOff => "turn-off",
            Opcode::LoadConfiguration => "load-configuration",
            Opcode::Detection => "detection",
        };
        f.write_str(name)
    }
}

/// Result channels the device is asked to return with each detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Channels {
    pub distance: bool,
    pub velocity: bool,
    pub snr: bool,
    pub i: bool,
    pub q: bool,
    pub movement: bool,
}

impl Channels {
    fn to_bits(self) -> u8 {
        [
            self.distance,
            self.velocity,
            self.snr,
            self.i,
            self.q,
            self.movement,
        ]
        .iter()
        .enumerate()
        .fold(0u8, |acc, (bit, &on)| acc | ((on as u8) << bit))
    }

    fn from_bits(bits: u8) -> Self {
        let on = |bit: u8| bits & (1 << bit) != 0;
        Self {
            distance: on(0),
            velocity: on(1),
            snr: on(2),
            i: on(3),
            q: on(4),
            movement: on(5),
        }
    }
}

/// Parameter block sent once per session with [`Opcode::LoadConfiguration`].
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceConfiguration {
    /// 1 = CW, 2 = sawtooth, 3 = triangle, 4 = dual rate.
    pub mode: u8,
    /// Start frequency offset above 24.000 GHz, in MHz.
    pub f0: u8,
    /// Sweep bandwidth in MHz.
    pub bandwidth: u8,
    /// Samples per sweep (`Ns`).
    pub samples: u8,
    /// Maximum number of reported targets (`Ntar`).
    pub max_targets: u8,
    /// Maximum range in metres.
    pub max_range: u8,
    pub mti: bool,
    /// Movement threshold.
    pub movement_threshold: u8,
    /// SNR margin over the surroundings, in dB (`Alpha`).
    pub alpha: u8,
    pub channels: Channels,
}

impl Default for DeviceConfiguration {
    /// Sawtooth at 24.005 GHz over the full 240 MHz, 200 samples, 3 targets up to 100 m,
    /// returning distance, SNR and raw I/Q.
    fn default() -> Self {
        Self {
            mode: 2,
            f0: 5,
            bandwidth: 240,
            samples: 200,
            max_targets: 3,
            max_range: 100,
            mti: false,
            movement_threshold: 0,
            alpha: 10,
            channels: Channels {
                distance: true,
                velocity: false,
                snr: true,
                i: true,
                q: true,
                movement: false,
            },
        }
    }
}

impl DeviceConfiguration {
    pub fn ns(&self) -> usize {
        self.samples as usize
    }

    pub fn ntar(&self) -> usize {
        self.max_targets as usize
    }

    pub fn validate(&self) -> Result<(), RadarError> {
        let check = |name: &str, value: u8, lo: u8, hi: u8| {
            if (lo..=hi).contains(&value) {
                Ok(())
            } else {
                Err(RadarError::InvalidConfig(format!(
                    "{name} = {value} outside {lo}..={hi}"
                )))
            }
        };
        check("mode", self.mode, 1, 4)?;
        check("f0", self.f0, 0, 245)?;
        check("bandwidth", self.bandwidth, 50, 240)?;
        check("samples", self.samples, 50, 200)?;
        check("max_targets", self.max_targets, 1, 5)?;
        check("max_range", self.max_range, 1, 100)?;
        check("movement_threshold", self.movement_threshold, 0, 4)?;
        check("alpha", self.alpha, 3, 25)?;
        if u16::from(self.f0) + u16::from(self.bandwidth) > 245 {
            return Err(RadarError::InvalidConfig(format!(
                "sweep {}..{} MHz leaves the 245 MHz band",
                self.f0,
                u16::from(self.f0) + u16::from(self.bandwidth)
            )));
        }
        Ok(())
    }

    pub fn to_payload(&self) -> [u8; CONFIG_LEN] {
        [
            self.mode,
            self.f0,
            self.bandwidth,
            self.samples,
            self.max_targets,
            self.max_range,
            self.mti as u8,
            self.movement_threshold,
            self.alpha,
            self.channels.to_bits(),
        ]
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, RadarError> {
        let p: &[u8; CONFIG_LEN] = payload.try_into().map_err(|_| {
            RadarError::Protocol(format!(
                "configuration payload is {} bytes, expected {CONFIG_LEN}",
                payload.len()
            ))
        })?;
        Ok(Self {
            mode: p[0],
            f0: p[1],
            bandwidth: p[2],
            samples: p[3],
            max_targets: p[4],
            max_range: p[5],
            mti: p[6] != 0,
            movement_threshold: p[7],
            alpha: p[8],
            channels: Channels::from_bits(p[9]),
        })
    }
}

/// One detection response, valid for a single processing cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    pub target_count: usize,
    pub distances: Vec<f32>,
    pub velocities: Vec<f32>,
    pub snr: Vec<f32>,
    pub i: Vec<u16>,
    pub q: Vec<u16>,
    pub movement: bool,
}

pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn seal(mut frame: Vec<u8>) -> Vec<u8> {
    frame.push(checksum(&frame));
    frame
}

pub fn encode_request(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.push(opcode as u8);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    seal(frame)
}

/// Splits one request frame off the front of `bytes`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the opcode, payload and
/// the number of bytes consumed.
pub fn decode_request(bytes: &[u8]) -> Result<Option<(Opcode, Vec<u8>, usize)>, RadarError> {
    let [op, len, ..] = bytes else {
        return Ok(None);
    };
    let total = *len as usize + 3;
    if bytes.len() < total {
        return Ok(None);
    }
    let opcode = Opcode::from_byte(*op)
        .ok_or_else(|| RadarError::Protocol(format!("unknown opcode 0x{op:02x}")))?;
    let expected = checksum(&bytes[..total - 1]);
    if bytes[total - 1] != expected {
        return Err(RadarError::Protocol(format!(
            "request checksum 0x{:02x}, expected 0x{expected:02x}",
            bytes[total - 1]
        )));
    }
    Ok(Some((opcode, bytes[2..total - 1].to_vec(), total)))
}

pub fn encode_status(opcode: Opcode, status: u8) -> Vec<u8> {
    seal(vec![ACK, opcode as u8, status])
}

/// Checks the three-byte header shared by every response.
pub fn check_header(header: &[u8; 3], opcode: Opcode) -> Result<u8, RadarError> {
    if header[0] != ACK {
        return Err(RadarError::Protocol(format!(
            "expected ack 0x{ACK:02x}, got 0x{:02x}",
            header[0]
        )));
    }
    if header[1] != opcode as u8 {
        return Err(RadarError::Protocol(format!(
            "response echoes opcode 0x{:02x}, expected 0x{:02x} ({opcode})",
            header[1], opcode as u8
        )));
    }
    Ok(header[2])
}

pub fn verify_checksum(frame: &[u8], received: u8) -> Result<(), RadarError> {
    let expected = checksum(frame);
    if expected == received {
        Ok(())
    } else {
        Err(RadarError::Protocol(format!(
            "response checksum 0x{received:02x}, expected 0x{expected:02x}"
        )))
    }
}

/// Bytes that follow the target-count byte of a successful detection response,
/// excluding the trailing checksum.
pub fn detection_body_len(config: &DeviceConfiguration, target_count: usize) -> usize {
    let ch = config.channels;
    let per_target = 4 * (ch.distance as usize + ch.velocity as usize + ch.snr as usize);
    let raw = 2 * config.ns() * (ch.i as usize + ch.q as usize);
    per_target * target_count + raw + ch.movement as usize
}

pub fn encode_detection(
    config: &DeviceConfiguration,
    status: u8,
    result: &DetectionResult,
) -> Vec<u8> {
    let mut frame = vec![ACK, Opcode::Detection as u8, status];
    if status != STATUS_OK {
        return seal(frame);
    }
    let ch = config.channels;
    let count = result.target_count;
    frame.push(count as u8);
    let put_f32 = |frame: &mut Vec<u8>, values: &[f32]| {
        for k in 0..count {
            frame.extend_from_slice(&values.get(k).copied().unwrap_or(0.0).to_le_bytes());
        }
    };
    if ch.distance {
        put_f32(&mut frame, &result.distances);
    }
    if ch.velocity {
        put_f32(&mut frame, &result.velocities);
    }
    if ch.snr {
        put_f32(&mut frame, &result.snr);
    }
    let put_u16 = |frame: &mut Vec<u8>, values: &[u16]| {
        for k in 0..config.ns() {
            frame.extend_from_slice(&values.get(k).copied().unwrap_or(0).to_le_bytes());
        }
    };
    if ch.i {
        put_u16(&mut frame, &result.i);
    }
    if ch.q {
        put_u16(&mut frame, &result.q);
    }
    if ch.movement {
        frame.push(result.movement as u8);
    }
    seal(frame)
}

/// Decodes the body of a successful detection response (everything between the
/// target-count byte and the checksum).
pub fn decode_detection_body(
    config: &DeviceConfiguration,
    target_count: usize,
    body: &[u8],
) -> Result<DetectionResult, RadarError> {
    if target_count > config.ntar() {
        return Err(RadarError::Protocol(format!(
            "device reported {target_count} targets, configured for at most {}",
            config.ntar()
        )));
    }
    let expected = detection_body_len(config, target_count);
    if body.len() != expected {
        return Err(RadarError::Protocol(format!(
            "detection body is {} bytes, expected {expected}",
            body.len()
        )));
    }

    let ch = config.channels;
    let mut cursor = body;
    let mut take_f32 = |on: bool| -> Vec<f32> {
        if !on {
            return Vec::new();
        }
        let (head, rest) = cursor.split_at(4 * target_count);
        cursor = rest;
        head.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    };
    let distances = take_f32(ch.distance);
    let velocities = take_f32(ch.velocity);
    let snr = take_f32(ch.snr);

    let ns = config.ns();
    let mut take_u16 = |on: bool| -> Vec<u16> {
        if !on {
            return Vec::new();
        }
        let (head, rest) = cursor.split_at(2 * ns);
        cursor = rest;
        head.chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect()
    };
    let i = take_u16(ch.i);
    let q = take_u16(ch.q);
    let movement = ch.movement && cursor.first().is_some_and(|&b| b != 0);

    Ok(DetectionResult {
        target_count,
        distances,
        velocities,
        snr,
        i,
        q,
        movement,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_carries_checksum() {
        let frame = encode_request(Opcode::TurnOn, &[]);
        assert_eq!(frame, vec![0x10, 0x00, 0x10]);
        let (op, payload, used) = decode_request(&frame).unwrap().unwrap();
        assert_eq!(op, Opcode::TurnOn);
        assert!(payload.is_empty());
        assert_eq!(used, 3);
    }

    #[test]
    fn partial_request_waits_for_more_bytes() {
        let frame = encode_request(Opcode::LoadConfiguration, &[1, 2, 3]);
        assert!(decode_request(&frame[..4]).unwrap().is_none());
    }

    #[test]
    fn corrupted_request_is_rejected() {
        let mut frame = encode_request(Opcode::Detection, &[]);
        frame[2] ^= 0xff;
        assert!(matches!(
            decode_request(&frame),
            Err(RadarError::Protocol(_))
        ));
    }

    #[test]
    fn configuration_payload_keeps_all_sixteen_parameters() {
        let mut cfg = DeviceConfiguration::default();
        cfg.mti = true;
        cfg.movement_threshold = 3;
        cfg.channels.velocity = true;
        cfg.channels.movement = true;
        let payload = cfg.to_payload();
        assert_eq!(payload[9], 0b11_1111);
        assert_eq!(DeviceConfiguration::from_payload(&payload).unwrap(), cfg);
    }

    #[test]
    fn default_configuration_is_valid() {
        DeviceConfiguration::default().validate().unwrap();
    }

    #[test]
    fn out_of_band_sweep_is_invalid() {
        let cfg = DeviceConfiguration {
            f0: 100,
            bandwidth: 240,
            ..DeviceConfiguration::default()
        };
        assert!(matches!(cfg.validate(), Err(RadarError::InvalidConfig(_))));
        let cfg = DeviceConfiguration {
            samples: 20,
            ..DeviceConfiguration::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn detection_frame_layout_follows_channels() {
        let cfg = DeviceConfiguration::default();
        let result = DetectionResult {
            target_count: 2,
            distances: vec![12.3, 40.0],
            snr: vec![5.0, -1.0],
            i: (0..200).collect(),
            q: (0..200).map(|v| 4095 - v).collect(),
            ..DetectionResult::default()
        };
        let frame = encode_detection(&cfg, STATUS_OK, &result);
        // header + count + 2x(dist, snr) + 2x200 u16 + checksum
        assert_eq!(frame.len(), 3 + 1 + 16 + 800 + 1);
        let header: [u8; 3] = frame[..3].try_into().unwrap();
        assert_eq!(check_header(&header, Opcode::Detection).unwrap(), 0);
        let body = &frame[4..frame.len() - 1];
        verify_checksum(&frame[..frame.len() - 1], frame[frame.len() - 1]).unwrap();
        let decoded = decode_detection_body(&cfg, frame[3] as usize, body).unwrap();
        assert_eq!(decoded, result);
    }

    #[test]
    fn too_many_targets_is_a_protocol_error() {
        let cfg = DeviceConfiguration::default();
        let body = vec![0u8; detection_body_len(&cfg, 4)];
        assert!(matches!(
            decode_detection_body(&cfg, 4, &body),
            Err(RadarError::Protocol(_))
        ));
    }

    #[test]
    fn failed_detection_has_no_body() {
        let cfg = DeviceConfiguration::default();
        let frame = encode_detection(&cfg, 3, &DetectionResult::default());
        assert_eq!(frame.len(), 4);
        let header: [u8; 3] = frame[..3].try_into().unwrap();
        assert_eq!(check_header(&header, Opcode::Detection).unwrap(), 3);
    }

    #[test]
    fn wrong_ack_is_rejected() {
        assert!(check_header(&[0x00, 0x10, 0x00], Opcode::TurnOn).is_err());
        assert!(check_header(&[ACK, 0x11, 0x00], Opcode::TurnOn).is_err());
    }
}
