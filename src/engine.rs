// src/engine.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, trace, warn};

use crate::drivers::{DetectionResult, PhaseHistory, RadarDevice, RadarError, SignalProcessor};
use crate::timer::SessionTimer;
use crate::types::{EventBus, RadarEvent};
use crate::ultrasonic::UltrasonicReader;

/// 每 N 个周期才发一次绘图快照
pub const SNAPSHOT_EVERY: u64 = 10;

/// 采集循环退出的原因
#[derive(Debug)]
pub enum ExitReason {
    /// 外部清除了 `is_taking_data`
    Stopped,
    /// 定时会话已到时
    Expired,
    /// 雷达在会话中途出错
    Fault(RadarError),
}

/// 采集循环：对已配置的雷达反复请求检测，并把结果发布到事件总线。
///
/// 设备、倒计时和超声波读取器都归它所有，关闭流程在一处统一收尾。
pub struct AcquisitionLoop {
    device: RadarDevice,
    processor: SignalProcessor,
    history: PhaseHistory,
    timer: SessionTimer,
    ultrasonic: Option<UltrasonicReader>,
    bus: EventBus,
    is_taking_data: Arc<AtomicBool>,
    duration_secs: u64,
    cycles: u64,
    finished: bool,
}

impl AcquisitionLoop {
    /// `device` 必须已经完成配置（见 [`RadarDevice::load_configuration`]）
    pub fn new(
        device: RadarDevice,
        timer: SessionTimer,
        ultrasonic: Option<UltrasonicReader>,
        bus: EventBus,
        is_taking_data: Arc<AtomicBool>,
        duration_secs: u64,
    ) -> Result<Self, RadarError> {
        let config = device.configuration().ok_or_else(|| {
            RadarError::InvalidConfig("device has not been configured".into())
        })?;
        let ch = config.channels;
        if !(ch.snr && ch.i && ch.q) {
            return Err(RadarError::InvalidConfig(
                "acquisition needs the SNR, I and Q channels enabled".into(),
            ));
        }
        let processor = SignalProcessor::new(config.ns());
        Ok(Self {
            device,
            processor,
            history: PhaseHistory::default(),
            timer,
            ultrasonic,
            bus,
            is_taking_data,
            duration_secs,
            cycles: 0,
            finished: false,
        })
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn history(&self) -> &PhaseHistory {
        &self.history
    }

    /// 一直运行到被停止、超时或出错，然后执行关闭流程
    pub fn run(&mut self) -> ExitReason {
        self.timer.start();
        info!(
            "acquisition started ({})",
            if self.duration_secs == 0 {
                "unbounded".to_string()
            } else {
                format!("{} s", self.duration_secs)
            }
        );

        let reason = loop {
            // 1. 停止 / 超时检查
            if !self.is_taking_data.load(Ordering::Acquire) {
                break ExitReason::Stopped;
            }
            if self.duration_secs != 0 && self.timer.remaining_secs() < 0 {
                break ExitReason::Expired;
            }
            // 2. 检测 + 信号处理
            match self.cycle() {
                Ok(processed) => trace!("cycle {} processed {processed} target(s)", self.cycles),
                Err(err) if !err.is_fatal() => warn!("cycle {} degraded: {err}", self.cycles),
                Err(err) => {
                    error!("radar fault, ending session: {err}");
                    break ExitReason::Fault(err);
                }
            }
        };

        info!("acquisition ended after {} cycles: {reason:?}", self.cycles);
        self.shutdown();
        reason
    }

    /// 一次检测请求加处理，返回通过门限的目标数
    pub fn cycle(&mut self) -> Result<usize, RadarError> {
        let detection = self.device.request_detection()?;
        let processed = self.process_detection(&detection);
        self.cycles += 1;
        processed
    }

    /// SNR 门限 + 逐目标处理。
    ///
    /// 设备按 SNR 降序返回目标，遇到第一个 SNR <= 0 就结束本周期，后面的不再看。
    pub fn process_detection(&mut self, detection: &DetectionResult) -> Result<usize, RadarError> {
        let mut processed = 0;
        for idx in 0..detection.target_count {
            let snr = detection.snr.get(idx).copied().unwrap_or(f32::NEG_INFINITY);
            if snr <= 0.0 {
                debug!("target {idx} below SNR gate ({snr}), skipping rest of cycle");
                break;
            }

            // 处理并发布: I, Q, 幅度谱, 峰值相位
            let target = self.processor.process(&detection.i, &detection.q)?;
            self.history.push(target.peak_phase);

            self.bus.publish(RadarEvent::InPhase(target.calibrated_i));
            self.bus.publish(RadarEvent::Quadrature(target.calibrated_q));
            self.bus.publish(RadarEvent::Magnitude(target.magnitude.clone()));
            self.bus.publish(RadarEvent::PeakPhase(target.peak_phase));
            if self.cycles % SNAPSHOT_EVERY == 0 {
                self.bus.publish(RadarEvent::Snapshot {
                    phase_history: self.history.snapshot(),
                    magnitude: target.magnitude,
                });
            }

            // 超声波可选，没有传感器时直接跳过
            match self.latest_ultrasonic() {
                Ok(distance) => self.bus.publish(RadarEvent::Ultrasonic(distance)),
                Err(RadarError::SensorAbsent) => {}
                Err(err) => warn!("ultrasonic reading unavailable: {err}"),
            }
            processed += 1;
        }
        Ok(processed)
    }

    fn latest_ultrasonic(&self) -> Result<f64, RadarError> {
        self.ultrasonic
            .as_ref()
            .map(UltrasonicReader::read)
            .ok_or(RadarError::SensorAbsent)
    }

    /// 关闭流程：断电、关串口、停超声波、停计时器，最后发 `Finished`。
    /// 重复调用无效果。
    pub fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.is_taking_data.store(false, Ordering::Release);

        self.device.power_off();
        self.device.close();
        if let Some(ultrasonic) = &self.ultrasonic {
            ultrasonic.stop();
        }
        self.timer.stop();
        self.bus.publish(RadarEvent::Finished);
        info!("session finished");
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
