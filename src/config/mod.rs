use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smithay::backend::allocator::Modifier;
use toml::map::Entry;
use tracing::{debug, info, warn};

use crate::buffer::DEFAULT_RING_SIZE;
use crate::error::ConfigurationError;
use crate::present::StrategyKind;
use crate::render::Technique;
use crate::scheduler::{DEFAULT_BUSY_RETRY_LIMIT, DEFAULT_REPORT_INTERVAL, DEFAULT_RETIRE_TIMEOUT};

/// Environment variable naming one more config file, merged last.
pub const CONFIG_ENV: &str = "SCANOUT_CONFIG";
const LOCAL_CONFIG: &str = "scanout.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of frames to render, unbounded when unset.
    pub frames: Option<u64>,
    /// Render into buffers that are never shown, on a render node.
    pub offscreen: bool,
    pub report_interval_secs: f64,
    #[serde(default)]
    pub display: DisplaySection,
    #[serde(default)]
    pub buffers: BuffersSection,
    #[serde(default)]
    pub presentation: PresentationSection,
    #[serde(default)]
    pub render: RenderSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frames: None,
            offscreen: false,
            report_interval_secs: DEFAULT_REPORT_INTERVAL.as_secs_f64(),
            display: DisplaySection::default(),
            buffers: BuffersSection::default(),
            presentation: PresentationSection::default(),
            render: RenderSection::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySection {
    pub device: Option<PathBuf>,
    /// Advertised mode name (`1920x1080`, `1920x1080@60`), or `WxH` offscreen.
    pub mode: Option<String>,
    /// Refresh filter in Hz, 0 for any.
    pub refresh: u32,
    /// Connector object ID or index.
    pub connector: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuffersSection {
    /// Four character DRM format code.
    pub format: String,
    /// Format modifier, decimal or `0x` hex. Implicit when unset.
    pub modifier: Option<String>,
    pub ring_size: usize,
    pub surfaceless: bool,
}

impl Default for BuffersSection {
    fn default() -> Self {
        Self {
            format: "XR24".to_string(),
            modifier: None,
            ring_size: DEFAULT_RING_SIZE,
            surfaceless: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresentationSection {
    pub strategy: StrategyKind,
    pub nonblocking: bool,
    pub fencing: bool,
    pub retire_timeout_ms: u64,
    pub busy_retry_limit: u32,
    /// Stop on any key when stdin is a terminal.
    pub watch_input: bool,
}

impl Default for PresentationSection {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Legacy,
            nonblocking: false,
            fencing: true,
            retire_timeout_ms: DEFAULT_RETIRE_TIMEOUT.as_millis() as u64,
            busy_retry_limit: DEFAULT_BUSY_RETRY_LIMIT,
            watch_input: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSection {
    pub technique: Technique,
    /// MSAA samples, 0 or 1 to disable.
    pub samples: u32,
}

impl Config {
    /// Loads the built-in defaults merged with every config file found.
    pub fn load() -> Self {
        let mut layers = Vec::new();
        // lowest to highest priority
        layers.extend(get_system_config_path());
        layers.extend(get_user_config_path());
        layers.extend(get_local_config_path());
        if let Some(path) = std::env::var_os(CONFIG_ENV).map(PathBuf::from) {
            if path.exists() {
                layers.push(path);
            } else {
                warn!("{CONFIG_ENV} points to {}, which does not exist", path.display());
            }
        }
        Self::load_layers(&layers)
    }

    /// Merges `layers` in order on top of the defaults.
    pub fn load_layers(layers: &[PathBuf]) -> Self {
        let mut merged = match toml::Value::try_from(Self::default()) {
            Ok(value) => value,
            Err(err) => {
                warn!("failed to serialize default config: {err}");
                return Self::default();
            }
        };

        let mut found_any_config = false;
        for path in layers {
            found_any_config |= merge_file(&mut merged, path);
        }
        if !found_any_config {
            debug!("no configuration file found, using defaults");
        }

        merged.try_into().unwrap_or_else(|err| {
            warn!("Falling back to default config due to invalid overrides: {err}");
            Self::default()
        })
    }

    pub fn retire_timeout(&self) -> Duration {
        Duration::from_millis(self.presentation.retire_timeout_ms.max(1))
    }

    pub fn report_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.report_interval_secs)
            .ok()
            .filter(|interval| !interval.is_zero())
            .unwrap_or(DEFAULT_REPORT_INTERVAL)
    }

    pub fn modifier(&self) -> Result<Modifier, ConfigurationError> {
        match self.buffers.modifier.as_deref() {
            Some(modifier) => parse_modifier(modifier),
            None => Ok(Modifier::Invalid),
        }
    }
}

fn merge_file(merged: &mut toml::Value, path: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(path) else {
        return false;
    };
    match content.parse::<toml::Value>() {
        Ok(value) => {
            merge_value(merged, value);
            info!("Loaded config from {}", path.display());
            true
        }
        Err(err) => {
            warn!("Failed to parse {}: {err}", path.display());
            false
        }
    }
}

fn merge_value(base: &mut toml::Value, overrides: toml::Value) {
    match (base, overrides) {
        (toml::Value::Table(base_map), toml::Value::Table(override_map)) => {
            for (key, override_value) in override_map {
                match base_map.entry(key) {
                    Entry::Occupied(mut entry) => merge_value(entry.get_mut(), override_value),
                    Entry::Vacant(entry) => {
                        entry.insert(override_value);
                    }
                }
            }
        }
        (base_value, override_value) => {
            *base_value = override_value;
        }
    }
}

/// Parses a format modifier given as decimal or `0x` prefixed hex.
pub fn parse_modifier(value: &str) -> Result<Modifier, ConfigurationError> {
    let value = value.trim();
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };
    parsed
        .map(Modifier::from)
        .map_err(|_| ConfigurationError::InvalidModifier(value.to_string()))
}

fn get_system_config_path() -> Option<PathBuf> {
    let path = PathBuf::from("/etc/scanout/config.toml");
    if path.exists() {
        Some(path)
    } else {
        None
    }
}

fn get_user_config_path() -> Option<PathBuf> {
    let config_dir = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(".config"))
        })?;

    let path = config_dir.join("scanout").join("config.toml");
    if path.exists() {
        Some(path)
    } else {
        None
    }
}

fn get_local_config_path() -> Option<PathBuf> {
    let path = PathBuf::from(LOCAL_CONFIG);
    if path.exists() {
        Some(path)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.frames, None);
        assert_eq!(config.buffers.format, "XR24");
        assert_eq!(config.buffers.ring_size, 3);
        assert_eq!(config.presentation.strategy, StrategyKind::Legacy);
        assert!(config.presentation.fencing);
        assert_eq!(config.retire_timeout(), Duration::from_secs(1));
        assert_eq!(config.report_interval(), Duration::from_secs(2));
        assert_eq!(config.modifier().unwrap(), Modifier::Invalid);
    }

    #[test]
    fn sections_deserialize_from_toml() {
        let config: Config = toml::from_str(
            r#"
            frames = 600

            [presentation]
            strategy = "atomic"
            nonblocking = true

            [render]
            technique = "bars"
            samples = 4
        "#,
        )
        .expect("Config should deserialize");

        assert_eq!(config.frames, Some(600));
        assert_eq!(config.presentation.strategy, StrategyKind::Atomic);
        assert!(config.presentation.nonblocking);
        // untouched keys keep their defaults
        assert!(config.presentation.watch_input);
        assert_eq!(config.render.technique, Technique::Bars);
        assert_eq!(config.render.samples, 4);
    }

    #[test]
    #[serial]
    fn test_get_user_config_path_with_xdg_config_home() {
        let temp_dir = tempfile::tempdir().unwrap();

        let old_xdg = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", temp_dir.path());

        let config_dir = temp_dir.path().join("scanout");
        fs::create_dir_all(&config_dir).unwrap();
        let config_file = config_dir.join("config.toml");
        fs::write(&config_file, "# test config").unwrap();

        let path = get_user_config_path();
        assert_eq!(path, Some(config_file));

        if let Some(old) = old_xdg {
            env::set_var("XDG_CONFIG_HOME", old);
        } else {
            env::remove_var("XDG_CONFIG_HOME");
        }
    }

    #[test]
    #[serial]
    fn test_get_user_config_path_without_file() {
        let temp_dir = tempfile::tempdir().unwrap();

        let old_xdg = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", temp_dir.path());

        assert!(get_user_config_path().is_none());

        if let Some(old) = old_xdg {
            env::set_var("XDG_CONFIG_HOME", old);
        } else {
            env::remove_var("XDG_CONFIG_HOME");
        }
    }

    #[test]
    fn test_get_system_config_path() {
        if let Some(p) = get_system_config_path() {
            assert_eq!(p, PathBuf::from("/etc/scanout/config.toml"));
        }
    }

    #[test]
    fn later_layers_win() {
        let temp_dir = tempfile::tempdir().unwrap();
        let low = temp_dir.path().join("low.toml");
        let high = temp_dir.path().join("high.toml");
        fs::write(
            &low,
            r#"
            frames = 10
            [display]
            mode = "1280x720"
            connector = 2
        "#,
        )
        .unwrap();
        fs::write(
            &high,
            r#"
            [display]
            mode = "1920x1080@60"
        "#,
        )
        .unwrap();

        let config = Config::load_layers(&[low, temp_dir.path().join("missing.toml"), high]);
        assert_eq!(config.frames, Some(10));
        assert_eq!(config.display.mode.as_deref(), Some("1920x1080@60"));
        // merged key by key, not table by table
        assert_eq!(config.display.connector, Some(2));
    }

    #[test]
    fn invalid_overrides_fall_back_to_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let bad_type = temp_dir.path().join("bad.toml");
        fs::write(&bad_type, "frames = \"many\"").unwrap();
        assert_eq!(Config::load_layers(&[bad_type]), Config::default());

        let unparsable = temp_dir.path().join("broken.toml");
        fs::write(&unparsable, "[display\nmode = ").unwrap();
        assert_eq!(Config::load_layers(&[unparsable]), Config::default());
    }

    #[test]
    #[serial]
    fn env_config_is_merged_last() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file = temp_dir.path().join("env.toml");
        fs::write(&file, "offscreen = true\n[buffers]\nring_size = 4\n").unwrap();

        let old = env::var_os(CONFIG_ENV);
        env::set_var(CONFIG_ENV, &file);
        let config = Config::load();
        match old {
            Some(old) => env::set_var(CONFIG_ENV, old),
            None => env::remove_var(CONFIG_ENV),
        }

        assert!(config.offscreen);
        assert_eq!(config.buffers.ring_size, 4);
    }

    #[test]
    fn modifier_strings() {
        assert_eq!(parse_modifier("0").unwrap(), Modifier::Linear);
        assert_eq!(
            parse_modifier("0x100000000000001").unwrap(),
            Modifier::from(0x100000000000001u64)
        );
        assert_eq!(
            parse_modifier(" 72057594037927937 ").unwrap(),
            Modifier::from(72057594037927937u64)
        );
        assert!(matches!(
            parse_modifier("0xzz"),
            Err(ConfigurationError::InvalidModifier(_))
        ));
        assert!(parse_modifier("-1").is_err());
    }

    #[test]
    fn zero_report_interval_uses_default() {
        let config = Config {
            report_interval_secs: 0.0,
            ..Config::default()
        };
        assert_eq!(config.report_interval(), DEFAULT_REPORT_INTERVAL);
    }

    #[test]
    fn example_config_matches_defaults() {
        let config: Config = toml::from_str(include_str!("../../scanout.example.toml"))
            .expect("example config should deserialize");
        assert_eq!(config, Config::default());
    }
}
