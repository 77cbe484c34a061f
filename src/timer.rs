// src/timer.rs
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::types::{format_hms, EventBus, RadarEvent};

pub const TICK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Running,
    Stopped,
}

struct Shared {
    state: Mutex<TimerState>,
    wake: Condvar,
    remaining: AtomicI64,
}

/// 倒计时句柄, 可跨线程读取和停止
#[derive(Clone)]
pub struct TimerHandle {
    shared: Arc<Shared>,
}

impl TimerHandle {
    pub fn remaining_secs(&self) -> i64 {
        self.shared.remaining.load(Ordering::Acquire)
    }

    /// 已经过零
    pub fn is_expired(&self) -> bool {
        self.remaining_secs() < 0
    }

    pub fn state(&self) -> TimerState {
        self.shared
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(TimerState::Stopped)
    }

    /// 可重复调用; 返回后不会再有 tick
    pub fn stop(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            if *state != TimerState::Stopped {
                debug!("session timer stopped at {}", self.remaining_secs());
            }
            *state = TimerState::Stopped;
        }
        self.shared.wake.notify_all();
    }
}

/// 会话倒计时, 独立线程, 与采集节奏无关。
///
/// 启动即发第一个 tick。`remaining` 会继续减到负数, 是否结束由采集循环判断。
pub struct SessionTimer {
    handle: TimerHandle,
    period: Duration,
    bus: EventBus,
    worker: Option<JoinHandle<()>>,
}

impl SessionTimer {
    pub fn new(duration_secs: u64, bus: EventBus) -> Self {
        Self::with_period(duration_secs, TICK_PERIOD, bus)
    }

    pub fn with_period(duration_secs: u64, period: Duration, bus: EventBus) -> Self {
        let remaining = i64::try_from(duration_secs).unwrap_or(i64::MAX);
        Self {
            handle: TimerHandle {
                shared: Arc::new(Shared {
                    state: Mutex::new(TimerState::Idle),
                    wake: Condvar::new(),
                    remaining: AtomicI64::new(remaining),
                }),
            },
            period,
            bus,
            worker: None,
        }
    }

    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    pub fn remaining_secs(&self) -> i64 {
        self.handle.remaining_secs()
    }

    pub fn state(&self) -> TimerState {
        self.handle.state()
    }

    /// Idle -> Running, 其他状态下无效
    pub fn start(&mut self) {
        {
            let Ok(mut state) = self.handle.shared.state.lock() else {
                return;
            };
            if *state != TimerState::Idle {
                warn!("session timer start ignored in state {:?}", *state);
                return;
            }
            *state = TimerState::Running;
        }

        let shared = Arc::clone(&self.handle.shared);
        let bus = self.bus.clone();
        let period = self.period;
        let spawned = thread::Builder::new()
            .name("session-timer".into())
            .spawn(move || tick_loop(shared, bus, period));
        match spawned {
            Ok(worker) => self.worker = Some(worker),
            Err(err) => {
                warn!("could not spawn session timer: {err}");
                self.handle.stop();
            }
        }
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    /// 等待线程退出, 先调用 `stop`
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.handle.stop();
    }
}

fn tick_loop(shared: Arc<Shared>, bus: EventBus, period: Duration) {
    let Ok(mut state) = shared.state.lock() else {
        return;
    };
    while *state == TimerState::Running {
        // 持锁发布, 保证 stop 之后不会再有 tick
        let remaining = shared.remaining.fetch_sub(1, Ordering::AcqRel) - 1;
        bus.publish(RadarEvent::Tick {
            remaining_secs: remaining,
            formatted: format_hms(remaining),
        });
        state = match shared
            .wake
            .wait_timeout_while(state, period, |s| *s == TimerState::Running)
        {
            Ok((guard, _)) => guard,
            Err(_) => return,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;
    use std::time::Instant;

    #[test]
    fn ticks_down_and_formats() {
        let bus = EventBus::new();
        let rx = bus.subscribe(&[EventKind::Tick]);
        let mut timer = SessionTimer::with_period(3, Duration::from_millis(20), bus);
        timer.start();
        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(
            first,
            RadarEvent::Tick {
                remaining_secs: 2,
                formatted: "00:00:02".into()
            }
        );
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(second, RadarEvent::Tick { remaining_secs: 1, .. }));
        timer.stop();
        timer.join();
    }

    #[test]
    fn keeps_counting_past_zero() {
        let bus = EventBus::new();
        let rx = bus.subscribe(&[EventKind::Tick]);
        let mut timer = SessionTimer::with_period(1, Duration::from_millis(10), bus);
        timer.start();
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(1)).unwrap();
        }
        assert!(timer.handle().is_expired());
        timer.stop();
        timer.join();
    }

    #[test]
    fn no_ticks_after_stop() {
        let bus = EventBus::new();
        let rx = bus.subscribe(&[EventKind::Tick]);
        let mut timer = SessionTimer::with_period(100, Duration::from_millis(5), bus);
        timer.start();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        timer.stop();
        while rx.try_recv().is_ok() {}
        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
        assert_eq!(timer.state(), TimerState::Stopped);
        timer.stop();
        timer.join();
    }

    #[test]
    fn stop_wakes_the_worker_promptly() {
        let mut timer = SessionTimer::new(10, EventBus::new());
        timer.start();
        let started = Instant::now();
        timer.stop();
        timer.join();
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn one_tick_per_second() {
        let bus = EventBus::new();
        let rx = bus.subscribe(&[EventKind::Tick]);
        let mut timer = SessionTimer::new(5, bus);
        let started = Instant::now();
        timer.start();
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        let elapsed = started.elapsed();
        // ticks land at 0 s, 1 s and 2 s
        assert!(elapsed >= Duration::from_millis(1900), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2600), "{elapsed:?}");
        timer.stop();
        timer.join();
    }

    #[test]
    fn start_twice_is_ignored() {
        let mut timer = SessionTimer::with_period(5, Duration::from_millis(5), EventBus::new());
        timer.start();
        timer.stop();
        timer.start();
        assert_eq!(timer.state(), TimerState::Stopped);
        timer.join();
    }
}
