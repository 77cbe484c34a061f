// src/main.rs
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{debug, info, warn};

use uradsense::drivers::transport::{detect_radar_port, list_ports};
use uradsense::drivers::{Link, SimulatedRadar, SimulatedUltrasonic};
use uradsense::settings::parse_duration;
use uradsense::{AppSettings, EventKind, ExitReason, RadarEvent, RadarSession, SessionConfig, SessionRecorder};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "uRAD radar + ultrasonic acquisition",
    long_about = "uRAD radar + ultrasonic acquisition.\n\n\
                  The radar command framing is this crate's own (see drivers::protocol), \
                  not the uRAD firmware protocol. Real hardware needs that module ported \
                  to the vendor protocol first; --simulate works out of the box."
)]
struct Args {
    /// Settings file (ports, output directory, plot bounds)
    #[arg(long, default_value = "settings.json")]
    settings: PathBuf,
    /// Session length as HH:MM:SS; omit to run until Enter is pressed
    #[arg(long)]
    duration: Option<String>,
    /// Use the built-in simulated radar and rangefinder (speaks this crate's own framing)
    #[arg(long, default_value_t = false)]
    simulate: bool,
    /// Where the CSV buffers go (overrides dir_path)
    #[arg(long)]
    output: Option<PathBuf>,
    /// Print the serial ports and exit
    #[arg(long, default_value_t = false)]
    list_ports: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    // 1. 列出串口
    if args.list_ports {
        let ports = list_ports();
        if ports.is_empty() {
            println!("no serial devices connected");
        }
        for port in ports {
            println!("{port}");
        }
        return Ok(());
    }

    // 2. 读取设置
    let mut settings = AppSettings::load(&args.settings)?;
    let duration_secs = match args.duration.as_deref() {
        Some(text) => parse_duration(text)?,
        None => 0,
    };
    let output_dir = args.output.clone().unwrap_or_else(|| settings.output_dir());
    debug!("plot bounds: {:?}", settings.plot_bounds());

    let mut session = if args.simulate {
        let config = SessionConfig {
            duration_secs,
            link: Link::Usb,
            ..SessionConfig::new("simulated")
        };
        RadarSession::new(config)
    } else {
        if settings.urad_port.is_none() {
            settings.urad_port = detect_radar_port();
            if let Some(port) = &settings.urad_port {
                info!("detected radar on {port}");
            }
        }
        RadarSession::new(settings.session_config(duration_secs)?)
    };

    // 3. 录制器要在启动前订阅, 否则会丢掉第一批数据
    let mut recorder = SessionRecorder::attach(session.events());
    let events = session.subscribe(&[EventKind::Tick, EventKind::UltrasonicParseError]);

    let started = if args.simulate {
        let radar = SimulatedRadar::synthetic(0x5eed).with_latency(Duration::from_millis(50));
        let sensor = SimulatedUltrasonic::synthetic(0x5eed);
        session.start_with(Box::new(radar), Some(Box::new(sensor)))
    } else {
        session.start()
    };
    started.context("starting radar session")?;

    // 回车停止
    let (enter_tx, enter_rx) = mpsc::channel();
    thread::spawn(move || {
        let mut line = String::new();
        if std::io::stdin().lock().read_line(&mut line).is_ok() {
            let _ = enter_tx.send(());
        }
    });
    println!("acquiring, press Enter to stop");

    while session.is_running() {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(RadarEvent::Tick { formatted, .. }) if duration_secs > 0 => info!("remaining {formatted}"),
            Ok(RadarEvent::Tick { formatted, .. }) => debug!("elapsed tick {formatted}"),
            Ok(RadarEvent::UltrasonicParseError { line, .. }) => debug!("ultrasonic noise {line:?}"),
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        recorder.drain();
        if enter_rx.try_recv().is_ok() {
            info!("stop requested");
            session.stop();
        }
    }

    // 4. 保存 CSV
    let reason = session.wait();
    let paths = recorder
        .save(&output_dir)
        .with_context(|| format!("saving session data to {}", output_dir.display()))?;
    println!("saved {} files to {}", paths.len(), output_dir.display());

    match reason {
        Some(ExitReason::Fault(err)) => Err(err).context("radar fault ended the session"),
        Some(reason) => {
            info!("session ended: {reason:?}");
            Ok(())
        }
        None => {
            warn!("session ended without an exit reason");
            Ok(())
        }
    }
}
