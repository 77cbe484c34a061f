// src/types.rs
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

// 核心发给订阅者的消息
#[derive(Clone, Debug, PartialEq)]
pub enum RadarEvent {
    // 校准后的 I 路采样
    InPhase(Vec<f64>),
    // 校准后的 Q 路采样
    Quadrature(Vec<f64>),
    // 幅度谱 2 * |FFT|
    Magnitude(Vec<f64>),
    // 峰值处相位 (弧度)
    PeakPhase(f64),
    // 绘图快照 (每 10 个周期一次)
    Snapshot {
        phase_history: Vec<f64>,
        magnitude: Vec<f64>,
    },
    // 超声波最新距离
    Ultrasonic(f64),
    // 倒计时, 每秒一次
    Tick { remaining_secs: i64, formatted: String },
    // 超声波解析失败的行 (读取线程继续运行)
    UltrasonicParseError { line: String, reason: String },
    // 会话已结束
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    InPhase,
    Quadrature,
    Magnitude,
    PeakPhase,
    Snapshot,
    Ultrasonic,
    Tick,
    UltrasonicParseError,
    Finished,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::InPhase,
        EventKind::Quadrature,
        EventKind::Magnitude,
        EventKind::PeakPhase,
        EventKind::Snapshot,
        EventKind::Ultrasonic,
        EventKind::Tick,
        EventKind::UltrasonicParseError,
        EventKind::Finished,
    ];
}

impl RadarEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RadarEvent::InPhase(_) => EventKind::InPhase,
            RadarEvent::Quadrature(_) => EventKind::Quadrature,
            RadarEvent::Magnitude(_) => EventKind::Magnitude,
            RadarEvent::PeakPhase(_) => EventKind::PeakPhase,
            RadarEvent::Snapshot { .. } => EventKind::Snapshot,
            RadarEvent::Ultrasonic(_) => EventKind::Ultrasonic,
            RadarEvent::Tick { .. } => EventKind::Tick,
            RadarEvent::UltrasonicParseError { .. } => EventKind::UltrasonicParseError,
            RadarEvent::Finished => EventKind::Finished,
        }
    }
}

struct Subscriber {
    kinds: Vec<EventKind>,
    tx: Sender<RadarEvent>,
}

// 事件总线: 按类型过滤, 分发给各个订阅者
// clone 共享同一订阅列表; 接收端被丢弃的订阅者在下次发布时移除
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kinds: &[EventKind]) -> Receiver<RadarEvent> {
        let (tx, rx) = channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(Subscriber {
                kinds: kinds.to_vec(),
                tx,
            });
        }
        rx
    }

    pub fn subscribe_all(&self) -> Receiver<RadarEvent> {
        self.subscribe(&EventKind::ALL)
    }

    pub fn publish(&self, event: RadarEvent) {
        let kind = event.kind();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|sub| !sub.kinds.contains(&kind) || sub.tx.send(event.clone()).is_ok());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|subs| subs.len()).unwrap_or(0)
    }
}

// 格式化为 HH:MM:SS, 超时后带 `-` 前缀
pub fn format_hms(seconds: i64) -> String {
    let sign = if seconds < 0 { "-" } else { "" };
    let total = seconds.unsigned_abs();
    let hours = total / 3600;
    let mins = (total % 3600) / 60;
    let secs = total % 60;
    format!("{sign}{hours:02}:{mins:02}:{secs:02}")
}
