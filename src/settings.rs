// src/settings.rs
use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context};
use serde::{Deserialize, Deserializer, Serialize};

use crate::drivers::{DeviceConfiguration, Link};
use crate::session::SessionConfig;

/// 应用设置 (`settings.json`)
///
/// 旧版文件所有值都是字符串, 未设置时写 `"None"`, 两种格式都能读。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    #[serde(deserialize_with = "optional_text")]
    pub urad_port: Option<String>,
    #[serde(rename = "ultrasonik_port", deserialize_with = "optional_text")]
    pub ultrasonic_port: Option<String>,
    #[serde(deserialize_with = "optional_text")]
    pub dir_path: Option<String>,
    #[serde(deserialize_with = "optional_number")]
    pub phase_max: Option<f64>,
    #[serde(deserialize_with = "optional_number")]
    pub phase_min: Option<f64>,
    #[serde(deserialize_with = "optional_number")]
    pub mag_max: Option<f64>,
    #[serde(deserialize_with = "optional_number")]
    pub mag_min: Option<f64>,
    pub using_usb: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            urad_port: None,
            ultrasonic_port: None,
            dir_path: None,
            phase_max: None,
            phase_min: None,
            mag_max: None,
            mag_min: None,
            using_usb: true,
        }
    }
}

/// 相位 / 幅度图的坐标范围, 只负责透传
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlotBounds {
    pub phase: (f64, f64),
    pub magnitude: (f64, f64),
}

impl Default for PlotBounds {
    fn default() -> Self {
        Self {
            phase: (-PI, PI),
            magnitude: (0.0, 10.0),
        }
    }
}

impl AppSettings {
    /// 文件不存在时用默认值; 读不了则报错
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        if !path_ref.exists() {
            log::info!("no settings at {}, using defaults", path_ref.display());
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading settings {}", path_ref.display()))?;
        let settings: AppSettings = serde_json::from_str(&contents)
            .with_context(|| format!("parsing settings {}", path_ref.display()))?;
        Ok(settings)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path_ref, json)
            .with_context(|| format!("writing settings {}", path_ref.display()))?;
        Ok(())
    }

    pub fn link(&self) -> Link {
        if self.using_usb {
            Link::Usb
        } else {
            Link::Uart
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir_path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn plot_bounds(&self) -> PlotBounds {
        let fallback = PlotBounds::default();
        PlotBounds {
            phase: (
                self.phase_min.unwrap_or(fallback.phase.0),
                self.phase_max.unwrap_or(fallback.phase.1),
            ),
            magnitude: (
                self.mag_min.unwrap_or(fallback.magnitude.0),
                self.mag_max.unwrap_or(fallback.magnitude.1),
            ),
        }
    }

    /// 生成会话配置, 此时雷达端口必须已知
    pub fn session_config(&self, duration_secs: u64) -> anyhow::Result<SessionConfig> {
        let Some(radar_port) = self.urad_port.clone() else {
            bail!("no radar port configured (set urad_port or plug in the radar)");
        };
        Ok(SessionConfig {
            radar_port,
            ultrasonic_port: self.ultrasonic_port.clone(),
            link: self.link(),
            duration_secs,
            device: DeviceConfiguration::default(),
        })
    }
}

/// `HH:MM:SS` 转秒数, 小时不限, 分和秒必须 < 60
pub fn parse_duration(text: &str) -> anyhow::Result<u64> {
    let parts: Vec<&str> = text.trim().split(':').collect();
    ensure!(parts.len() == 3, "expected HH:MM:SS, got {text:?}");
    let mut fields = [0u64; 3];
    for (slot, part) in fields.iter_mut().zip(&parts) {
        *slot = part
            .parse()
            .with_context(|| format!("bad number {part:?} in duration {text:?}"))?;
    }
    let [hours, mins, secs] = fields;
    ensure!(mins < 60 && secs < 60, "minutes and seconds must be below 60 in {text:?}");
    Ok(hours * 3600 + mins * 60 + secs)
}

fn is_unset(text: &str) -> bool {
    let text = text.trim();
    text.is_empty() || text == "None" || text == "null"
}

fn optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|v| !is_unset(v)))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(f64),
    Text(String),
}

fn optional_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberOrText>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrText::Number(v)) => Ok(Some(v)),
        Some(NumberOrText::Text(text)) if is_unset(&text) => Ok(None),
        Some(NumberOrText::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
