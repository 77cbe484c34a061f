use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};

use crate::drivers::protocol::{
    self, DetectionResult, DeviceConfiguration, Opcode, STATUS_OK,
};
use crate::drivers::transport::{Link, SerialTransport};
use crate::drivers::RadarError;

/// How long a single response may take before the frame counts as truncated.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    PoweredOn,
    Configured,
    Detecting,
}

impl DeviceState {
    /// Transition table: the state reached after `opcode` succeeds, or `None` if the
    /// command is not allowed from here. Turning off is always allowed.
    pub fn after(self, opcode: Opcode) -> Option<DeviceState> {
        use DeviceState::*;
        match (self, opcode) {
            (_, Opcode::TurnOff) => Some(Closed),
            (Closed, Opcode::TurnOn) => Some(PoweredOn),
            (PoweredOn, Opcode::LoadConfiguration) => Some(Configured),
            (Configured | Detecting, Opcode::Detection) => Some(Detecting),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Closed => "closed",
            DeviceState::PoweredOn => "powered on",
            DeviceState::Configured => "configured",
            DeviceState::Detecting => "detecting",
        };
        f.write_str(name)
    }
}

/// Request/response command layer over one radar transport.
pub struct RadarDevice {
    transport: Box<dyn SerialTransport>,
    link: Link,
    state: DeviceState,
    config: Option<DeviceConfiguration>,
    closed: bool,
}

impl RadarDevice {
    pub fn new(transport: Box<dyn SerialTransport>) -> Self {
        let link = transport.link();
        Self {
            transport,
            link,
            state: DeviceState::Closed,
            config: None,
            closed: false,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn link(&self) -> Link {
        self.link
    }

    pub fn configuration(&self) -> Option<&DeviceConfiguration> {
        self.config.as_ref()
    }

    pub fn power_on(&mut self) -> Result<(), RadarError> {
        let next = self.guard(Opcode::TurnOn)?;
        self.command(Opcode::TurnOn, &[])?;
        self.state = next;
        info!("radar powered on");
        Ok(())
    }

    pub fn load_configuration(&mut self, config: &DeviceConfiguration) -> Result<(), RadarError> {
        let next = self.guard(Opcode::LoadConfiguration)?;
        config.validate()?;
        self.command(Opcode::LoadConfiguration, &config.to_payload())?;
        self.config = Some(config.clone());
        self.state = next;
        info!(
            "radar configured: mode {} f0 {} BW {} Ns {} Ntar {}",
            config.mode, config.f0, config.bandwidth, config.samples, config.max_targets
        );
        Ok(())
    }

    /// One synchronous detection exchange.
    pub fn request_detection(&mut self) -> Result<DetectionResult, RadarError> {
        let next = self.guard(Opcode::Detection)?;
        let config = self
            .config
            .clone()
            .ok_or(RadarError::InvalidState {
                command: Opcode::Detection,
                state: self.state,
            })?;

        let result = self.exchange_detection(&config);
        self.link.settle();
        let result = result?;
        self.state = next;
        Ok(result)
    }

    /// Best-effort; failures are logged because this runs during teardown.
    pub fn power_off(&mut self) {
        if self.closed {
            debug!("power-off skipped, transport already closed");
            self.state = DeviceState::Closed;
            return;
        }
        match self.command(Opcode::TurnOff, &[]) {
            Ok(()) => info!("radar powered off"),
            Err(err) => warn!("radar power-off failed: {err}"),
        }
        self.state = DeviceState::Closed;
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.transport.close();
            self.closed = true;
        }
    }

    fn guard(&self, opcode: Opcode) -> Result<DeviceState, RadarError> {
        self.state.after(opcode).ok_or(RadarError::InvalidState {
            command: opcode,
            state: self.state,
        })
    }

    /// Sends a simple command and checks its status response.
    fn command(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), RadarError> {
        let result = self.exchange_status(opcode, payload);
        self.link.settle();
        result
    }

    fn exchange_status(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), RadarError> {
        self.transport
            .write(&protocol::encode_request(opcode, payload))?;
        let mut frame = [0u8; 4];
        self.read_frame(&mut frame)?;
        let header = [frame[0], frame[1], frame[2]];
        let status = protocol::check_header(&header, opcode)?;
        protocol::verify_checksum(&frame[..3], frame[3])?;
        if status != STATUS_OK {
            return Err(RadarError::Device {
                command: opcode,
                code: status,
            });
        }
        Ok(())
    }

    fn exchange_detection(
        &mut self,
        config: &DeviceConfiguration,
    ) -> Result<DetectionResult, RadarError> {
        self.transport
            .write(&protocol::encode_request(Opcode::Detection, &[]))?;
        let mut header = [0u8; 3];
        self.read_frame(&mut header)?;
        let status = protocol::check_header(&header, Opcode::Detection)?;

        if status != STATUS_OK {
            let mut sum = [0u8; 1];
            self.read_frame(&mut sum)?;
            protocol::verify_checksum(&header, sum[0])?;
            return Err(RadarError::Device {
                command: Opcode::Detection,
                code: status,
            });
        }

        let mut count = [0u8; 1];
        self.read_frame(&mut count)?;
        let target_count = count[0] as usize;
        if target_count > config.ntar() {
            return Err(RadarError::Protocol(format!(
                "device reported {target_count} targets, configured for at most {}",
                config.ntar()
            )));
        }

        let mut rest = vec![0u8; protocol::detection_body_len(config, target_count) + 1];
        self.read_frame(&mut rest)?;
        let (body, sum) = rest.split_at(rest.len() - 1);

        let mut covered = Vec::with_capacity(4 + body.len());
        covered.extend_from_slice(&header);
        covered.push(count[0]);
        covered.extend_from_slice(body);
        protocol::verify_checksum(&covered, sum[0])?;

        protocol::decode_detection_body(config, target_count, body)
    }

    fn read_frame(&mut self, buf: &mut [u8]) -> Result<(), RadarError> {
        let got = self.transport.read_exact(buf, RESPONSE_TIMEOUT)?;
        if got < buf.len() {
            return Err(RadarError::Protocol(format!(
                "truncated response: expected {} bytes, got {got}",
                buf.len()
            )));
        }
        Ok(())
    }
}

impl Drop for RadarDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::simulated::SimulatedRadar;

    fn device(radar: SimulatedRadar) -> RadarDevice {
        RadarDevice::new(Box::new(radar))
    }

    #[test]
    fn transition_table_matches_handshake_order() {
        use DeviceState::*;
        assert_eq!(Closed.after(Opcode::TurnOn), Some(PoweredOn));
        assert_eq!(PoweredOn.after(Opcode::LoadConfiguration), Some(Configured));
        assert_eq!(Configured.after(Opcode::Detection), Some(Detecting));
        assert_eq!(Detecting.after(Opcode::Detection), Some(Detecting));
        assert_eq!(Closed.after(Opcode::Detection), None);
        assert_eq!(PoweredOn.after(Opcode::Detection), None);
        assert_eq!(Detecting.after(Opcode::LoadConfiguration), None);
        for state in [Closed, PoweredOn, Configured, Detecting] {
            assert_eq!(state.after(Opcode::TurnOff), Some(Closed));
        }
    }

    #[test]
    fn handshake_then_detection() {
        let radar = SimulatedRadar::scripted(vec![DetectionResult {
            target_count: 1,
            distances: vec![2.5],
            snr: vec![8.0],
            i: vec![2048; 200],
            q: vec![2048; 200],
            ..DetectionResult::default()
        }]);
        let log = radar.command_log();
        let mut dev = device(radar);
        dev.power_on().unwrap();
        dev.load_configuration(&DeviceConfiguration::default()).unwrap();
        let result = dev.request_detection().unwrap();
        assert_eq!(result.target_count, 1);
        assert_eq!(result.distances, vec![2.5]);
        assert_eq!(result.i.len(), 200);
        assert_eq!(dev.state(), DeviceState::Detecting);
        dev.power_off();
        assert_eq!(dev.state(), DeviceState::Closed);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Opcode::TurnOn,
                Opcode::LoadConfiguration,
                Opcode::Detection,
                Opcode::TurnOff
            ]
        );
    }

    #[test]
    fn detection_before_configuration_is_rejected_locally() {
        let radar = SimulatedRadar::scripted(Vec::new());
        let log = radar.command_log();
        let mut dev = device(radar);
        dev.power_on().unwrap();
        let err = dev.request_detection().unwrap_err();
        assert!(matches!(
            err,
            RadarError::InvalidState {
                command: Opcode::Detection,
                state: DeviceState::PoweredOn
            }
        ));
        assert_eq!(*log.lock().unwrap(), vec![Opcode::TurnOn]);
    }

    #[test]
    fn non_zero_status_is_a_device_error() {
        let radar = SimulatedRadar::scripted(Vec::new()).failing(Opcode::TurnOn, 7);
        let mut dev = device(radar);
        let err = dev.power_on().unwrap_err();
        assert!(matches!(
            err,
            RadarError::Device {
                command: Opcode::TurnOn,
                code: 7
            }
        ));
        assert_eq!(dev.state(), DeviceState::Closed);
    }

    #[test]
    fn exhausted_script_reports_a_fault() {
        let mut dev = device(SimulatedRadar::scripted(Vec::new()));
        dev.power_on().unwrap();
        dev.load_configuration(&DeviceConfiguration::default()).unwrap();
        assert!(matches!(
            dev.request_detection(),
            Err(RadarError::Device {
                command: Opcode::Detection,
                ..
            })
        ));
    }

    #[test]
    fn power_off_after_close_does_not_panic() {
        let mut dev = device(SimulatedRadar::scripted(Vec::new()));
        dev.close();
        dev.close();
        dev.power_off();
        dev.power_off();
        assert_eq!(dev.state(), DeviceState::Closed);
    }

    fn time_detections(link: Link, cycles: usize) -> std::time::Duration {
        let script = (0..cycles).map(|_| DetectionResult {
            i: vec![2048; 200],
            q: vec![2048; 200],
            ..DetectionResult::default()
        });
        let mut dev = device(SimulatedRadar::scripted(script).with_link(link));
        dev.power_on().unwrap();
        dev.load_configuration(&DeviceConfiguration::default()).unwrap();
        let started = std::time::Instant::now();
        for _ in 0..cycles {
            dev.request_detection().unwrap();
        }
        started.elapsed()
    }

    #[test]
    fn uart_waits_after_every_detection_and_usb_does_not() {
        use crate::drivers::transport::SETTLE_DELAY;
        let uart = time_detections(Link::Uart, 20);
        let usb = time_detections(Link::Usb, 20);
        assert!(uart >= SETTLE_DELAY * 20, "uart took {uart:?}");
        assert!(usb < SETTLE_DELAY * 10, "usb took {usb:?}");
    }

    #[test]
    fn uart_handshake_commands_settle() {
        use crate::drivers::transport::SETTLE_DELAY;
        let mut dev = device(SimulatedRadar::scripted(Vec::new()).with_link(Link::Uart));
        let started = std::time::Instant::now();
        dev.power_on().unwrap();
        dev.load_configuration(&DeviceConfiguration::default()).unwrap();
        dev.power_off();
        assert!(started.elapsed() >= SETTLE_DELAY * 3);
    }

    #[test]
    fn uart_link_still_completes_handshake() {
        let radar = SimulatedRadar::scripted(Vec::new()).with_link(Link::Uart);
        let mut dev = device(radar);
        assert_eq!(dev.link(), Link::Uart);
        dev.power_on().unwrap();
        dev.load_configuration(&DeviceConfiguration::default()).unwrap();
        assert_eq!(dev.state(), DeviceState::Configured);
    }
}
