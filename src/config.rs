use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::capture::{CaptureConfig, CaptureFormat, ControlPreset, ControlSetting};
use crate::server::ServerConfig;
use crate::streamer::LoopConfig;

const DEFAULT_DEVICE: &str = "/dev/video0";
const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_BUFFERS: u32 = 4;
const DEFAULT_IOCTL_RETRIES: u32 = 5;
const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = crate::server::DEFAULT_PORT;
const DEFAULT_MAX_CLIENTS: usize = crate::server::DEFAULT_MAX_CLIENTS;
const DEFAULT_MAX_REQUEST_BYTES: usize = crate::server::DEFAULT_MAX_REQUEST_BYTES;
const DEFAULT_READ_CHUNK: usize = crate::server::DEFAULT_READ_CHUNK;
const DEFAULT_RECOVERY_INTERVAL_MS: u64 = 1_000;
const DEFAULT_DRAIN_BUDGET_MS: u64 = 500;
const DEFAULT_DRAIN_ATTEMPT_MS: u64 = 5;
const DEFAULT_STATS_WINDOW: u64 = 500;
const DEFAULT_INSERT_HUFFMAN: bool = false;

#[derive(Debug, Deserialize, Default)]
struct StreamerConfigFile {
    camera: Option<CameraConfigFile>,
    server: Option<ServerConfigFile>,
    stream: Option<StreamConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    buffers: Option<u32>,
    ioctl_retries: Option<u32>,
    controls: Option<Vec<ControlEntry>>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    bind: Option<Vec<String>>,
    port: Option<u16>,
    max_clients: Option<usize>,
    max_request_bytes: Option<usize>,
    read_chunk: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    recovery_interval_ms: Option<u64>,
    drain_budget_ms: Option<u64>,
    drain_attempt_ms: Option<u64>,
    stats_window: Option<u64>,
    insert_huffman: Option<bool>,
}

/// One camera control, by name or by raw V4L2 id.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ControlEntry {
    pub name: Option<String>,
    pub id: Option<u32>,
    pub value: i32,
}

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub camera: CameraSettings,
    pub server: ServerSettings,
    pub stream: LoopSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffers: u32,
    pub ioctl_retries: u32,
    pub controls: Vec<ControlEntry>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind: Vec<String>,
    pub port: u16,
    pub max_clients: usize,
    pub max_request_bytes: usize,
    pub read_chunk: usize,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub recovery_interval: Duration,
    /// Total time a drain waits for in-flight frames.
    pub drain_budget: Duration,
    /// Wait per drain attempt.
    pub drain_attempt: Duration,
    pub stats_window: u64,
    pub insert_huffman: bool,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self::from_file(StreamerConfigFile::default())
    }
}

impl StreamerConfig {
    /// Defaults, then the file named by `UVC_STREAMER_CONFIG`, then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("UVC_STREAMER_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StreamerConfigFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let server = file.server.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        Self {
            camera: CameraSettings {
                device: camera.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
                width: camera.width.unwrap_or(DEFAULT_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_HEIGHT),
                fps: camera.fps.unwrap_or(DEFAULT_FPS),
                buffers: camera.buffers.unwrap_or(DEFAULT_BUFFERS),
                ioctl_retries: camera.ioctl_retries.unwrap_or(DEFAULT_IOCTL_RETRIES),
                controls: camera.controls.unwrap_or_default(),
            },
            server: ServerSettings {
                bind: server
                    .bind
                    .unwrap_or_else(|| vec![DEFAULT_BIND.to_string()]),
                port: server.port.unwrap_or(DEFAULT_PORT),
                max_clients: server.max_clients.unwrap_or(DEFAULT_MAX_CLIENTS),
                max_request_bytes: server
                    .max_request_bytes
                    .unwrap_or(DEFAULT_MAX_REQUEST_BYTES),
                read_chunk: server.read_chunk.unwrap_or(DEFAULT_READ_CHUNK),
            },
            stream: LoopSettings {
                recovery_interval: Duration::from_millis(
                    stream
                        .recovery_interval_ms
                        .unwrap_or(DEFAULT_RECOVERY_INTERVAL_MS),
                ),
                drain_budget: Duration::from_millis(
                    stream.drain_budget_ms.unwrap_or(DEFAULT_DRAIN_BUDGET_MS),
                ),
                drain_attempt: Duration::from_millis(
                    stream.drain_attempt_ms.unwrap_or(DEFAULT_DRAIN_ATTEMPT_MS),
                ),
                stats_window: stream.stats_window.unwrap_or(DEFAULT_STATS_WINDOW),
                insert_huffman: stream.insert_huffman.unwrap_or(DEFAULT_INSERT_HUFFMAN),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("UVC_STREAMER_DEVICE") {
            if !device.trim().is_empty() {
                self.camera.device = device.trim().to_string();
            }
        }
        if let Ok(port) = std::env::var("UVC_STREAMER_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| anyhow!("UVC_STREAMER_PORT must be a port number"))?;
        }
        if let Ok(bind) = std::env::var("UVC_STREAMER_BIND") {
            let parsed = split_csv(&bind);
            if !parsed.is_empty() {
                self.server.bind = parsed;
            }
        }
        if let Ok(max_clients) = std::env::var("UVC_STREAMER_MAX_CLIENTS") {
            self.server.max_clients = max_clients
                .trim()
                .parse()
                .map_err(|_| anyhow!("UVC_STREAMER_MAX_CLIENTS must be an integer"))?;
        }
        if let Ok(fps) = std::env::var("UVC_STREAMER_FPS") {
            self.camera.fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("UVC_STREAMER_FPS must be an integer"))?;
        }
        Ok(())
    }

    /// Checks ranges and that every camera control resolves.
    pub fn validate(&self) -> Result<()> {
        let camera = &self.camera;
        if camera.device.trim().is_empty() {
            return Err(anyhow!("camera device must not be empty"));
        }
        if camera.width == 0 || camera.height == 0 {
            return Err(anyhow!("capture resolution must be non-zero"));
        }
        if camera.fps == 0 {
            return Err(anyhow!("capture frame rate must be greater than zero"));
        }
        if camera.buffers == 0 {
            return Err(anyhow!("at least one capture buffer is required"));
        }
        if camera.ioctl_retries == 0 {
            return Err(anyhow!("ioctl_retries must be greater than zero"));
        }
        if self.server.bind.is_empty() {
            return Err(anyhow!("at least one bind address is required"));
        }
        if self.server.max_clients == 0 {
            return Err(anyhow!("max_clients must be greater than zero"));
        }
        if self.server.read_chunk == 0 {
            return Err(anyhow!("read_chunk must be greater than zero"));
        }
        self.control_preset()?;
        Ok(())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device: self.camera.device.clone(),
            format: CaptureFormat {
                width: self.camera.width,
                height: self.camera.height,
                fps: self.camera.fps,
            },
            buffer_count: self.camera.buffers,
            ioctl_retries: self.camera.ioctl_retries,
        }
    }

    /// Server settings. A lone client may wait half a frame interval for its socket.
    pub fn server_config(&self) -> ServerConfig {
        let fps = u64::from(self.camera.fps.max(1));
        ServerConfig {
            bind: self.server.bind.clone(),
            port: self.server.port,
            max_clients: self.server.max_clients,
            max_request_bytes: self.server.max_request_bytes,
            read_chunk: self.server.read_chunk,
            send_wait: Duration::from_micros(1_000_000 / fps / 2),
            ..ServerConfig::default()
        }
    }

    pub fn loop_config(&self) -> LoopConfig {
        let stream = &self.stream;
        let attempt_ms = stream.drain_attempt.as_millis().max(1);
        let attempts = (stream.drain_budget.as_millis() / attempt_ms).max(1);
        LoopConfig {
            recovery_interval: stream.recovery_interval,
            drain_attempts: attempts.min(u128::from(u32::MAX)) as u32,
            drain_wait: stream.drain_attempt,
            stats_window: stream.stats_window,
            insert_huffman: stream.insert_huffman,
            ..LoopConfig::default()
        }
    }

    pub fn control_preset(&self) -> Result<ControlPreset> {
        let settings = self
            .camera
            .controls
            .iter()
            .map(|entry| match (&entry.name, entry.id) {
                (Some(name), _) => ControlSetting::named(name, entry.value),
                (None, Some(id)) => Ok(ControlSetting::raw(id, entry.value)),
                (None, None) => Err(anyhow!("camera control needs a name or an id")),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ControlPreset::new(settings))
    }
}

fn read_config_file(path: &Path) -> Result<StreamerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = StreamerConfig::default();
        assert_eq!(cfg.camera.device, "/dev/video0");
        assert_eq!((cfg.camera.width, cfg.camera.height, cfg.camera.fps), (1280, 720, 30));
        assert_eq!(cfg.camera.buffers, 4);
        assert_eq!(cfg.server.port, 8081);
        assert_eq!(cfg.server.max_clients, 20);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn derived_component_configs() {
        let cfg = StreamerConfig::default();
        assert_eq!(cfg.server_config().send_wait, Duration::from_micros(16_666));
        let lc = cfg.loop_config();
        assert_eq!(lc.drain_attempts, 100);
        assert_eq!(lc.drain_wait, Duration::from_millis(5));
        assert_eq!(lc.recovery_interval, Duration::from_secs(1));
        assert_eq!(cfg.capture_config().format, CaptureFormat::default());
    }

    #[test]
    fn controls_need_name_or_id() {
        let mut cfg = StreamerConfig::default();
        cfg.camera.controls = vec![ControlEntry {
            name: None,
            id: None,
            value: 1,
        }];
        assert!(cfg.validate().is_err());

        cfg.camera.controls = vec![
            ControlEntry {
                name: Some("focus_auto".to_string()),
                id: None,
                value: 0,
            },
            ControlEntry {
                name: None,
                id: Some(0x009a_0902),
                value: 250,
            },
        ];
        let preset = cfg.control_preset().unwrap();
        assert_eq!(preset.settings().len(), 2);
        assert_eq!(preset.settings()[1].id, 0x009a_0902);
    }

    #[test]
    fn zero_values_are_rejected() {
        let mut cfg = StreamerConfig::default();
        cfg.camera.fps = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = StreamerConfig::default();
        cfg.server.bind.clear();
        assert!(cfg.validate().is_err());
    }
}
