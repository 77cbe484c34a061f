// src/recorder.rs
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::time::SystemTime;

use anyhow::Context;

use crate::types::{EventBus, EventKind, RadarEvent};

// 每种数据一个 CSV, 按文件名顺序
const LABELS: [&str; 5] = ["I", "Q", "PHASE", "MAGNITUDE", "ULTRASONIC"];

enum Row {
    Vector(Vec<f64>),
    Scalar(f64),
}

// 会话数据缓存, 结束时写成 DATA_<KIND>_<stamp>.csv
pub struct SessionRecorder {
    rx: Receiver<RadarEvent>,
    rows: [Vec<Row>; 5],
}

impl SessionRecorder {
    // 立即开始订阅
    pub fn attach(bus: &EventBus) -> Self {
        let rx = bus.subscribe(&[
            EventKind::InPhase,
            EventKind::Quadrature,
            EventKind::PeakPhase,
            EventKind::Magnitude,
            EventKind::Ultrasonic,
        ]);
        Self {
            rx,
            rows: Default::default(),
        }
    }

    // 把已发布的事件搬进缓存
    pub fn drain(&mut self) -> usize {
        let mut moved = 0;
        while let Ok(event) = self.rx.try_recv() {
            let (slot, row) = match event {
                RadarEvent::InPhase(v) => (0, Row::Vector(v)),
                RadarEvent::Quadrature(v) => (1, Row::Vector(v)),
                RadarEvent::PeakPhase(p) => (2, Row::Scalar(p)),
                RadarEvent::Magnitude(v) => (3, Row::Vector(v)),
                RadarEvent::Ultrasonic(d) => (4, Row::Scalar(d)),
                _ => continue,
            };
            self.rows[slot].push(row);
            moved += 1;
        }
        moved
    }

    // 某类数据的行数 (I / Q / PHASE / MAGNITUDE / ULTRASONIC)
    pub fn len(&self, label: &str) -> usize {
        LABELS
            .iter()
            .position(|&l| l == label)
            .map_or(0, |slot| self.rows[slot].len())
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(Vec::is_empty)
    }

    pub fn clear(&mut self) {
        for rows in &mut self.rows {
            rows.clear();
        }
    }

    // 文件名带 UNIX 时间戳, 空缓存也会写出空文件
    pub fn save(&mut self, dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let stamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.save_stamped(dir, &stamp.to_string())
    }

    pub fn save_stamped(&mut self, dir: &Path, stamp: &str) -> anyhow::Result<Vec<PathBuf>> {
        self.drain();
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

        let mut written = Vec::with_capacity(LABELS.len());
        for (label, rows) in LABELS.iter().zip(&self.rows) {
            let path = dir.join(format!("DATA_{label}_{stamp}.csv"));
            write_rows(&path, rows).with_context(|| format!("writing {}", path.display()))?;
            log::info!("saved {} rows to {}", rows.len(), path.display());
            written.push(path);
        }
        Ok(written)
    }
}

fn write_rows(path: &Path, rows: &[Row]) -> std::io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    for row in rows {
        match row {
            Row::Scalar(v) => writeln!(w, "{v}")?,
            Row::Vector(values) => {
                for (n, v) in values.iter().enumerate() {
                    if n > 0 {
                        write!(w, ",")?;
                    }
                    write!(w, "{v}")?;
                }
                writeln!(w)?;
            }
        }
    }
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_only_recorded_kinds() {
        let bus = EventBus::new();
        let mut recorder = SessionRecorder::attach(&bus);
        bus.publish(RadarEvent::InPhase(vec![0.1, 0.2]));
        bus.publish(RadarEvent::Tick {
            remaining_secs: 3,
            formatted: "00:00:03".into(),
        });
        bus.publish(RadarEvent::PeakPhase(1.25));
        bus.publish(RadarEvent::Ultrasonic(101.5));
        assert_eq!(recorder.drain(), 3);
        assert_eq!(recorder.len("I"), 1);
        assert_eq!(recorder.len("PHASE"), 1);
        assert_eq!(recorder.len("Q"), 0);
        assert_eq!(recorder.len("TICK"), 0);
        recorder.clear();
        assert!(recorder.is_empty());
    }

    #[test]
    fn writes_one_file_per_kind() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let mut recorder = SessionRecorder::attach(&bus);
        bus.publish(RadarEvent::InPhase(vec![0.5, -0.25, 1.0]));
        bus.publish(RadarEvent::InPhase(vec![0.0, 0.0, 0.0]));
        bus.publish(RadarEvent::PeakPhase(-0.75));

        let paths = recorder.save_stamped(dir.path(), "1700000000").unwrap();
        let names: Vec<String> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "DATA_I_1700000000.csv",
                "DATA_Q_1700000000.csv",
                "DATA_PHASE_1700000000.csv",
                "DATA_MAGNITUDE_1700000000.csv",
                "DATA_ULTRASONIC_1700000000.csv",
            ]
        );
        assert_eq!(fs::read_to_string(&paths[0]).unwrap(), "0.5,-0.25,1\n0,0,0\n");
        assert_eq!(fs::read_to_string(&paths[2]).unwrap(), "-0.75\n");
        assert_eq!(fs::read_to_string(&paths[4]).unwrap(), "");
    }

    #[test]
    fn creates_missing_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("runs").join("today");
        let mut recorder = SessionRecorder::attach(&EventBus::new());
        let paths = recorder.save(&target).unwrap();
        assert_eq!(paths.len(), 5);
        assert!(paths.iter().all(|p| p.exists()));
    }
}
