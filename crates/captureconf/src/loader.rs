//! Config file discovery, loading, and environment variable overlay.

use crate::{CaptureConfig, ConfigError};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli). Only existing files
/// are returned.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/capturebus/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("capturebus/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("capturebus.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load a TOML file on top of `config`. Keys absent from the file keep
/// their current value.
pub fn load_from_file(config: &mut CaptureConfig, path: &Path) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    apply_toml(config, &contents, path)
}

fn apply_toml(config: &mut CaptureConfig, contents: &str, path: &Path) -> Result<(), ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let bad_value = |key: &str| ConfigError::Parse {
        path: path.to_path_buf(),
        message: format!("{} must be a non-negative integer", key),
    };

    if let Some(bind) = table.get("bind").and_then(|v| v.as_table()) {
        if let Some(v) = bind.get("endpoint").and_then(|v| v.as_str()) {
            config.bind.endpoint = v.to_string();
        }
        if let Some(v) = bind.get("max_frame_bytes").and_then(|v| v.as_integer()) {
            config.bind.max_frame_bytes =
                usize::try_from(v).map_err(|_| bad_value("bind.max_frame_bytes"))?;
        }
    }

    if let Some(service) = table.get("service").and_then(|v| v.as_table()) {
        if let Some(v) = service
            .get("max_wait_for_all_events_sent_ms")
            .and_then(|v| v.as_integer())
        {
            config.service.max_wait_for_all_events_sent_ms = u64::try_from(v)
                .map_err(|_| bad_value("service.max_wait_for_all_events_sent_ms"))?;
        }
    }

    if let Some(producer) = table.get("producer").and_then(|v| v.as_table()) {
        if let Some(v) = producer.get("endpoint").and_then(|v| v.as_str()) {
            config.producer.endpoint = v.to_string();
        }
        if let Some(v) = producer
            .get("reconnection_delay_ms")
            .and_then(|v| v.as_integer())
        {
            config.producer.reconnection_delay_ms =
                u64::try_from(v).map_err(|_| bad_value("producer.reconnection_delay_ms"))?;
        }
    }

    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level").and_then(|v| v.as_str()) {
            config.telemetry.log_level = v.to_string();
        }
    }

    Ok(())
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut CaptureConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, env::vars());
}

fn apply_overrides_from(
    config: &mut CaptureConfig,
    sources: &mut ConfigSources,
    vars: impl IntoIterator<Item = (String, String)>,
) {
    for (key, value) in vars {
        let applied = match key.as_str() {
            "CAPTUREBUS_ENDPOINT" => {
                config.bind.endpoint = value;
                true
            }
            "CAPTUREBUS_PRODUCER_ENDPOINT" => {
                config.producer.endpoint = value;
                true
            }
            "CAPTUREBUS_MAX_WAIT_MS" => match value.parse() {
                Ok(ms) => {
                    config.service.max_wait_for_all_events_sent_ms = ms;
                    true
                }
                Err(_) => false,
            },
            "CAPTUREBUS_RECONNECTION_DELAY_MS" => match value.parse() {
                Ok(ms) => {
                    config.producer.reconnection_delay_ms = ms;
                    true
                }
                Err(_) => false,
            },
            "CAPTUREBUS_LOG_LEVEL" | "RUST_LOG" => {
                config.telemetry.log_level = value;
                true
            }
            _ => false,
        };

        if applied {
            sources.env_overrides.push(key);
        }
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        let (var_name, rest) = match stripped.find('/') {
            Some(slash_pos) => (&stripped[..slash_pos], Some(&stripped[slash_pos + 1..])),
            None => (stripped, None),
        };
        if let Ok(var_value) = env::var(var_name) {
            let base = PathBuf::from(var_value);
            return match rest {
                Some(rest) => base.join(rest),
                None => base,
            };
        }
    }

    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> CaptureConfig {
        let mut config = CaptureConfig::default();
        apply_toml(&mut config, toml, Path::new("test.toml")).unwrap();
        config
    }

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn test_expand_path_absolute() {
        assert_eq!(expand_path("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_discover_config_files() {
        let _files = discover_config_files();
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = parse(
            r#"
[service]
max_wait_for_all_events_sent_ms = 50
"#,
        );
        assert_eq!(config.service.max_wait_for_all_events_sent_ms, 50);
        assert_eq!(config.bind, crate::BindConfig::default());
    }

    #[test]
    fn test_parse_full_toml() {
        let config = parse(
            r#"
[bind]
endpoint = "tcp://0.0.0.0:7600"
max_frame_bytes = 1048576

[service]
max_wait_for_all_events_sent_ms = 2500

[producer]
endpoint = "tcp://hub:7600"
reconnection_delay_ms = 100

[telemetry]
log_level = "debug"
"#,
        );

        assert_eq!(config.bind.endpoint, "tcp://0.0.0.0:7600");
        assert_eq!(config.bind.max_frame_bytes, 1_048_576);
        assert_eq!(config.service.max_wait_for_all_events_sent_ms, 2500);
        assert_eq!(config.producer.endpoint, "tcp://hub:7600");
        assert_eq!(config.producer.reconnection_delay_ms, 100);
        assert_eq!(config.telemetry.log_level, "debug");
    }

    #[test]
    fn test_later_file_wins_per_key() {
        let mut config = CaptureConfig::default();
        apply_toml(
            &mut config,
            "[bind]\nendpoint = \"tcp://a:1\"\n[telemetry]\nlog_level = \"warn\"\n",
            Path::new("first.toml"),
        )
        .unwrap();
        apply_toml(&mut config, "[bind]\nendpoint = \"tcp://b:2\"\n", Path::new("second.toml"))
            .unwrap();

        assert_eq!(config.bind.endpoint, "tcp://b:2");
        assert_eq!(config.telemetry.log_level, "warn");
    }

    #[test]
    fn test_negative_wait_rejected() {
        let mut config = CaptureConfig::default();
        let err = apply_toml(
            &mut config,
            "[service]\nmax_wait_for_all_events_sent_ms = -1\n",
            Path::new("bad.toml"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_wait_for_all_events_sent_ms"));
    }

    #[test]
    fn test_invalid_toml() {
        let mut config = CaptureConfig::default();
        assert!(apply_toml(&mut config, "[bind", Path::new("broken.toml")).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = CaptureConfig::default();
        let mut sources = ConfigSources::default();
        apply_overrides_from(
            &mut config,
            &mut sources,
            vec![
                ("CAPTUREBUS_MAX_WAIT_MS".to_string(), "75".to_string()),
                ("CAPTUREBUS_RECONNECTION_DELAY_MS".to_string(), "nope".to_string()),
                ("CAPTUREBUS_ENDPOINT".to_string(), "tcp://127.0.0.1:9".to_string()),
                ("UNRELATED".to_string(), "x".to_string()),
            ],
        );

        assert_eq!(config.service.max_wait_for_all_events_sent_ms, 75);
        assert_eq!(config.producer.reconnection_delay_ms, 5_000);
        assert_eq!(config.bind.endpoint, "tcp://127.0.0.1:9");
        assert_eq!(
            sources.env_overrides,
            vec!["CAPTUREBUS_MAX_WAIT_MS", "CAPTUREBUS_ENDPOINT"]
        );
    }
}
