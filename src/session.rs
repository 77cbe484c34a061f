// src/session.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};

use crate::drivers::transport::{Link, SerialPortTransport, SerialTransport};
use crate::drivers::{DeviceConfiguration, RadarDevice, RadarError};
use crate::engine::{AcquisitionLoop, ExitReason};
use crate::timer::{SessionTimer, TimerHandle, TICK_PERIOD};
use crate::types::{EventBus, EventKind, RadarEvent};
use crate::ultrasonic::{self, UltrasonicReader};

/// 会话配置, 启动后不再改变
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub radar_port: String,
    /// `None` 表示不接超声波
    pub ultrasonic_port: Option<String>,
    pub link: Link,
    /// 0 = 不限时
    pub duration_secs: u64,
    pub device: DeviceConfiguration,
}

impl SessionConfig {
    pub fn new(radar_port: impl Into<String>) -> Self {
        Self {
            radar_port: radar_port.into(),
            ultrasonic_port: None,
            link: Link::default(),
            duration_secs: 0,
            device: DeviceConfiguration::default(),
        }
    }

    pub fn validate(&self) -> Result<(), RadarError> {
        self.device.validate()?;
        let ch = self.device.channels;
        if !(ch.snr && ch.i && ch.q) {
            return Err(RadarError::InvalidConfig(
                "acquisition needs the SNR, I and Q channels enabled".into(),
            ));
        }
        Ok(())
    }
}

/// 一次采集会话: 握手, 采集线程, 倒计时, 收尾
pub struct RadarSession {
    config: SessionConfig,
    bus: EventBus,
    is_taking_data: Arc<AtomicBool>,
    tick_period: Duration,
    timer: Option<TimerHandle>,
    worker: Option<JoinHandle<ExitReason>>,
}

impl RadarSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            bus: EventBus::new(),
            is_taking_data: Arc::new(AtomicBool::new(false)),
            tick_period: TICK_PERIOD,
            timer: None,
            worker: None,
        }
    }

    /// 修改倒计时周期 (测试用), 时长里的每一 "秒" 变成 `period`
    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn subscribe(&self, kinds: &[EventKind]) -> Receiver<RadarEvent> {
        self.bus.subscribe(kinds)
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// 打开配置的串口并开始采集。
    ///
    /// 注意: 命令帧格式 (见 [`crate::drivers::protocol`]) 是本 crate 自定义的,
    /// 不是 uRAD 固件的原生协议。接真实硬件前需要先把 `drivers::protocol`
    /// 移植到厂商协议, 否则握手会报 `Protocol` 错误。
    pub fn start(&mut self) -> Result<(), RadarError> {
        self.config.validate()?;
        let radar = SerialPortTransport::open_radar(&self.config.radar_port, self.config.link)?;

        let ultrasonic = match &self.config.ultrasonic_port {
            Some(port) => match ultrasonic::open_port(port) {
                Ok(transport) => Some(Box::new(transport) as Box<dyn SerialTransport>),
                Err(err) => {
                    warn!("continuing without ultrasonic sensor: {err}");
                    None
                }
            },
            None => None,
        };

        self.start_with(Box::new(radar), ultrasonic)
    }

    /// 同 [`start`](Self::start), 但使用调用方已打开的传输
    pub fn start_with(
        &mut self,
        radar: Box<dyn SerialTransport>,
        ultrasonic: Option<Box<dyn SerialTransport>>,
    ) -> Result<(), RadarError> {
        if self.worker.is_some() {
            warn!("session already started");
            return Ok(());
        }
        self.config.validate()?;

        let mut device = RadarDevice::new(radar);
        if let Err(err) = handshake(&mut device, &self.config.device) {
            error!("radar handshake failed: {err}");
            device.power_off();
            device.close();
            return Err(err);
        }

        let reader = match ultrasonic {
            Some(transport) => match UltrasonicReader::spawn(transport, self.bus.clone()) {
                Ok(reader) => Some(reader),
                Err(err) => {
                    warn!("continuing without ultrasonic sensor: {err}");
                    None
                }
            },
            None => None,
        };

        let timer = SessionTimer::with_period(self.config.duration_secs, self.tick_period, self.bus.clone());
        self.timer = Some(timer.handle());
        self.is_taking_data.store(true, Ordering::Release);

        let mut acquisition = AcquisitionLoop::new(
            device,
            timer,
            reader,
            self.bus.clone(),
            Arc::clone(&self.is_taking_data),
            self.config.duration_secs,
        )?;
        let worker = thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || acquisition.run());
        match worker {
            Ok(worker) => {
                self.worker = Some(worker);
                info!("session started on {}", self.config.radar_port);
                Ok(())
            }
            Err(err) => {
                // 闭包连同采集循环已被丢弃, 关闭流程已执行
                self.is_taking_data.store(false, Ordering::Release);
                Err(err.into())
            }
        }
    }

    /// 让采集循环跑完当前周期后退出
    pub fn stop(&self) {
        self.is_taking_data.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// 等待采集线程结束。未启动、已等待过或线程 panic 时返回 `None`
    pub fn wait(&mut self) -> Option<ExitReason> {
        let worker = self.worker.take()?;
        match worker.join() {
            Ok(reason) => Some(reason),
            Err(_) => {
                error!("acquisition thread panicked");
                None
            }
        }
    }

    /// 倒计时句柄, 启动后才有
    pub fn timer(&self) -> Option<TimerHandle> {
        self.timer.clone()
    }

    /// 剩余秒数, 超时后为负
    pub fn remaining_secs(&self) -> i64 {
        match &self.timer {
            Some(timer) => timer.remaining_secs(),
            None => i64::try_from(self.config.duration_secs).unwrap_or(i64::MAX),
        }
    }
}

impl Drop for RadarSession {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
            self.wait();
        }
    }
}

fn handshake(device: &mut RadarDevice, config: &DeviceConfiguration) -> Result<(), RadarError> {
    device.power_on()?;
    device.load_configuration(config)
}
