// src/ultrasonic.rs
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::drivers::transport::{FrameConfig, Link, SerialPortTransport, SerialTransport};
use crate::drivers::RadarError;
use crate::types::{EventBus, RadarEvent};

/// 超声波模块固件的波特率
pub const ULTRASONIC_BAUD: u32 = 9_800;
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

// 最新距离, 读取线程写, 其他线程读
#[derive(Clone, Default)]
struct Reading(Arc<AtomicU64>);

impl Reading {
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

/// 解析一行距离数据, 忽略首尾空白 (含 `\r`), 空行返回 `Ok(None)`
pub fn parse_line(line: &[u8]) -> Result<Option<f64>, RadarError> {
    let text = std::str::from_utf8(line).map_err(|err| RadarError::Parse {
        line: String::from_utf8_lossy(line).into_owned(),
        reason: err.to_string(),
    })?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.parse::<f64>()
        .map(Some)
        .map_err(|err| RadarError::Parse {
            line: text.to_string(),
            reason: err.to_string(),
        })
}

/// 超声波后台读取线程
pub struct UltrasonicReader {
    reading: Reading,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

/// 按固定参数打开超声波串口
pub fn open_port(port: &str) -> Result<SerialPortTransport, RadarError> {
    let transport =
        SerialPortTransport::open(port, ULTRASONIC_BAUD, FrameConfig::default(), Link::Uart)?;
    info!("ultrasonic sensor on {port}");
    Ok(transport)
}

impl UltrasonicReader {
    pub fn spawn(transport: Box<dyn SerialTransport>, bus: EventBus) -> Result<Self, RadarError> {
        Self::spawn_with_timeout(transport, bus, READ_TIMEOUT)
    }

    pub fn spawn_with_timeout(
        mut transport: Box<dyn SerialTransport>,
        bus: EventBus,
        timeout: Duration,
    ) -> Result<Self, RadarError> {
        let reading = Reading::default();
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let reading = reading.clone();
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("ultrasonic".into())
                .spawn(move || {
                    read_loop(transport.as_mut(), &reading, &running, &bus, timeout);
                    transport.close();
                    debug!("ultrasonic reader exited");
                })?
        };

        Ok(Self {
            reading,
            running,
            worker: Some(worker),
        })
    }

    /// 最新有效距离, 还没有数据时为 0.0, 不阻塞
    pub fn read(&self) -> f64 {
        self.reading.load()
    }

    /// 请求线程在本次读取后退出, 不等待
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 等待线程退出 (线程退出时会关闭串口)
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for UltrasonicReader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop(
    transport: &mut dyn SerialTransport,
    reading: &Reading,
    running: &AtomicBool,
    bus: &EventBus,
    timeout: Duration,
) {
    while running.load(Ordering::Acquire) {
        let line = match transport.read_line(timeout) {
            Ok(line) => line,
            Err(err) => {
                warn!("ultrasonic read failed: {err}");
                thread::sleep(ERROR_BACKOFF);
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok(Some(distance)) => reading.store(distance),
            Ok(None) => {}
            Err(RadarError::Parse { line, reason }) => {
                warn!("skipping ultrasonic line {line:?}: {reason}");
                bus.publish(RadarEvent::UltrasonicParseError { line, reason });
            }
            Err(err) => warn!("ultrasonic line rejected: {err}"),
        }
    }
}
