//! Process-wide configuration for the sidecar.
//!
//! Settings are layered: built-in defaults, then `JSX_TOOL_*` environment
//! variables, then `<workingDir>/.jsxtool/config.json`, then explicit
//! overrides from the CLI or an embedding plugin. Later layers shadow
//! earlier ones.

use std::{
    env,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the per-project directory that holds the sidecar's files.
pub const PROJECT_DIR_NAME: &str = ".jsxtool";

/// Default registry queried for editor public keys.
const DEFAULT_KEY_REGISTRY_URL: &str = "https://api.jsxtool.com/v1/keys";

/// Default command the language facade forks for language intelligence.
const DEFAULT_LSP_WORKER_COMMAND: &str = "jsx-tool-lsp-worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpProtocol {
    Http,
    Https,
}

impl fmt::Display for HttpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpProtocol::Http => write!(f, "http"),
            HttpProtocol::Https => write!(f, "https"),
        }
    }
}

impl FromStr for HttpProtocol {
    type Err = ConfigError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        match source {
            "http" => Ok(HttpProtocol::Http),
            "https" => Ok(HttpProtocol::Https),
            _ => Err(ConfigError::InvalidValue {
                key: "protocol".to_owned(),
                value: source.to_owned(),
                expected: "http or https",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsProtocol {
    Ws,
    Wss,
}

impl fmt::Display for WsProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WsProtocol::Ws => write!(f, "ws"),
            WsProtocol::Wss => write!(f, "wss"),
        }
    }
}

impl FromStr for WsProtocol {
    type Err = ConfigError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        match source {
            "ws" => Ok(WsProtocol::Ws),
            "wss" => Ok(WsProtocol::Wss),
            _ => Err(ConfigError::InvalidValue {
                key: "wsProtocol".to_owned(),
                value: source.to_owned(),
                expected: "ws or wss",
            }),
        }
    }
}

/// The one process-wide settings record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub server_protocol: HttpProtocol,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub proxy_protocol: HttpProtocol,
    pub ws_host: String,
    pub ws_port: u16,
    pub ws_protocol: WsProtocol,
    pub working_directory: PathBuf,
    pub node_modules_dir: PathBuf,
    pub additional_directories: Vec<PathBuf>,
    pub inject_at: String,
    pub debug: bool,
    pub insecure: bool,
    pub no_proxy: bool,
    pub enable_logging: bool,
    pub key_registry_url: String,
    pub lsp_worker_command: String,

    /// Toggled by editor clients through the bus; read by the bundler plugin
    /// between rebuilds.
    #[serde(default)]
    pub should_modify_next_object_counter: bool,
}

/// The subset of options a config file or CLI layer may set. Every field is
/// optional; `None` means "inherit from the previous layer".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOverlay {
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub server_protocol: Option<HttpProtocol>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    pub proxy_protocol: Option<HttpProtocol>,
    pub ws_host: Option<String>,
    pub ws_port: Option<u16>,
    pub ws_protocol: Option<WsProtocol>,
    pub node_modules_dir: Option<PathBuf>,
    pub additional_directories: Option<Vec<PathBuf>>,
    pub inject_at: Option<String>,
    pub debug: Option<bool>,
    pub insecure: Option<bool>,
    pub no_proxy: Option<bool>,
    pub enable_logging: Option<bool>,
    pub key_registry_url: Option<String>,
    pub lsp_worker_command: Option<String>,
}

impl Config {
    pub fn defaults(working_directory: PathBuf) -> Self {
        let node_modules_dir = working_directory.join("node_modules");

        Config {
            server_host: "localhost".to_owned(),
            server_port: 3000,
            server_protocol: HttpProtocol::Http,
            proxy_host: "localhost".to_owned(),
            proxy_port: 12020,
            proxy_protocol: HttpProtocol::Http,
            ws_host: "localhost".to_owned(),
            ws_port: 12021,
            ws_protocol: WsProtocol::Ws,
            working_directory,
            node_modules_dir,
            additional_directories: Vec::new(),
            inject_at: "</head>".to_owned(),
            debug: false,
            insecure: false,
            no_proxy: false,
            enable_logging: false,
            key_registry_url: DEFAULT_KEY_REGISTRY_URL.to_owned(),
            lsp_worker_command: DEFAULT_LSP_WORKER_COMMAND.to_owned(),
            should_modify_next_object_counter: false,
        }
    }

    /// Loads configuration for `working_directory`, layering environment
    /// variables, the project's `config.json`, and `overrides` on top of the
    /// defaults.
    pub fn load(working_directory: &Path, overrides: ConfigOverlay) -> Result<Self, ConfigError> {
        if !working_directory.is_dir() {
            return Err(ConfigError::InvalidWorkingDirectory {
                path: working_directory.to_path_buf(),
            });
        }

        let working_directory = working_directory
            .canonicalize()
            .map_err(|source| ConfigError::Io {
                path: working_directory.to_path_buf(),
                source,
            })?;

        let mut config = Self::defaults(working_directory.clone());
        config.apply(overlay_from_env()?);

        let config_path = working_directory.join(PROJECT_DIR_NAME).join("config.json");
        if config_path.is_file() {
            let contents = fs_err::read_to_string(&config_path).map_err(|source| {
                ConfigError::Io {
                    path: config_path.clone(),
                    source: source.into(),
                }
            })?;
            let overlay: ConfigOverlay =
                serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: config_path.clone(),
                    source,
                })?;
            config.apply(overlay);
        }

        config.apply(overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply(&mut self, overlay: ConfigOverlay) {
        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = overlay.$field {
                    self.$field = value;
                })*
            };
        }

        merge!(
            server_host,
            server_port,
            server_protocol,
            proxy_host,
            proxy_port,
            proxy_protocol,
            ws_host,
            ws_port,
            ws_protocol,
            node_modules_dir,
            additional_directories,
            inject_at,
            debug,
            insecure,
            no_proxy,
            enable_logging,
            key_registry_url,
            lsp_worker_command,
        );
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.inject_at.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "injectAt".to_owned(),
                value: String::new(),
                expected: "a non-empty anchor substring",
            });
        }

        for port in [self.server_port, self.proxy_port, self.ws_port] {
            if port == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "port".to_owned(),
                    value: port.to_string(),
                    expected: "a non-zero TCP port",
                });
            }
        }

        Ok(())
    }

    /// Directory that holds config, keys, logs, and rules for this project.
    pub fn project_dir(&self) -> PathBuf {
        self.working_directory.join(PROJECT_DIR_NAME)
    }

    /// The directory roots that containment checks accept.
    pub fn allowed_roots(&self) -> Vec<PathBuf> {
        let mut roots = Vec::with_capacity(2 + self.additional_directories.len());
        roots.push(self.working_directory.clone());
        roots.push(self.node_modules_dir.clone());
        roots.extend(self.additional_directories.iter().cloned());
        roots
    }

    /// The WebSocket URL injected into proxied HTML pages.
    pub fn ws_url(&self) -> String {
        format!("{}://{}:{}", self.ws_protocol, self.ws_host, self.ws_port)
    }

    /// Base URL of the application dev server the proxy forwards to.
    pub fn server_base_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.server_protocol, self.server_host, self.server_port
        )
    }
}

/// Cheap pre-logging peek at `enableLogging`, needed before the full config
/// (and therefore the logger) exists.
pub fn quick_read_enable_logging(working_directory: &Path) -> bool {
    if let Ok(value) = env::var("JSX_TOOL_ENABLE_LOGGING") {
        return value == "1" || value == "true";
    }

    let path = working_directory.join(PROJECT_DIR_NAME).join("config.json");
    fs_err::read_to_string(path)
        .ok()
        .and_then(|contents| serde_json::from_str::<ConfigOverlay>(&contents).ok())
        .and_then(|overlay| overlay.enable_logging)
        .unwrap_or(false)
}

/// Shared handle to the live config. Steady-state mutation is limited to
/// `should_modify_next_object_counter`.
pub type SharedConfig = Arc<RwLock<Config>>;

pub fn shared(config: Config) -> SharedConfig {
    Arc::new(RwLock::new(config))
}

fn overlay_from_env() -> Result<ConfigOverlay, ConfigError> {
    fn var(name: &str) -> Option<String> {
        env::var(name).ok().filter(|value| !value.is_empty())
    }

    fn parse_port(name: &str) -> Result<Option<u16>, ConfigError> {
        match var(name) {
            Some(value) => {
                value
                    .parse::<u16>()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidValue {
                        key: name.to_owned(),
                        value,
                        expected: "a TCP port number",
                    })
            }
            None => Ok(None),
        }
    }

    fn parse_bool(name: &str) -> Result<Option<bool>, ConfigError> {
        match var(name) {
            Some(value) => match value.as_str() {
                "1" | "true" => Ok(Some(true)),
                "0" | "false" => Ok(Some(false)),
                _ => Err(ConfigError::InvalidValue {
                    key: name.to_owned(),
                    value,
                    expected: "1, 0, true, or false",
                }),
            },
            None => Ok(None),
        }
    }

    Ok(ConfigOverlay {
        server_host: var("JSX_TOOL_SERVER_HOST"),
        server_port: parse_port("JSX_TOOL_SERVER_PORT")?,
        server_protocol: var("JSX_TOOL_SERVER_PROTOCOL")
            .map(|value| value.parse())
            .transpose()?,
        proxy_host: var("JSX_TOOL_PROXY_HOST"),
        proxy_port: parse_port("JSX_TOOL_PROXY_PORT")?,
        proxy_protocol: var("JSX_TOOL_PROXY_PROTOCOL")
            .map(|value| value.parse())
            .transpose()?,
        ws_host: var("JSX_TOOL_WS_HOST"),
        ws_port: parse_port("JSX_TOOL_WS_PORT")?,
        ws_protocol: var("JSX_TOOL_WS_PROTOCOL")
            .map(|value| value.parse())
            .transpose()?,
        node_modules_dir: var("JSX_TOOL_NODE_MODULES_DIR").map(PathBuf::from),
        additional_directories: var("JSX_TOOL_ADDITIONAL_DIRECTORIES").map(|value| {
            value
                .split(':')
                .filter(|part| !part.is_empty())
                .map(PathBuf::from)
                .collect()
        }),
        inject_at: var("JSX_TOOL_INJECT_AT"),
        debug: parse_bool("JSX_TOOL_DEBUG")?,
        insecure: parse_bool("JSX_TOOL_INSECURE")?,
        no_proxy: parse_bool("JSX_TOOL_NO_PROXY")?,
        enable_logging: parse_bool("JSX_TOOL_ENABLE_LOGGING")?,
        key_registry_url: var("JSX_TOOL_KEY_REGISTRY_URL"),
        lsp_worker_command: var("JSX_TOOL_LSP_WORKER_COMMAND"),
    })
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid working directory '{}'", path.display())]
    InvalidWorkingDirectory { path: PathBuf },

    #[error("Invalid value '{value}' for {key} (expected {expected})")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("Could not read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_node_modules() {
        let config = Config::defaults(PathBuf::from("/tmp/project"));
        assert_eq!(config.node_modules_dir, PathBuf::from("/tmp/project/node_modules"));
        assert_eq!(config.inject_at, "</head>");
        assert_eq!(config.ws_url(), "ws://localhost:12021");
    }

    #[test]
    fn file_layer_shadows_defaults_and_overrides_shadow_file() {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join(PROJECT_DIR_NAME);
        fs_err::create_dir_all(&project_dir).unwrap();
        fs_err::write(
            project_dir.join("config.json"),
            r#"{ "serverPort": 4000, "wsPort": 15000 }"#,
        )
        .unwrap();

        let overrides = ConfigOverlay {
            ws_port: Some(16000),
            ..Default::default()
        };

        let config = Config::load(dir.path(), overrides).unwrap();
        assert_eq!(config.server_port, 4000);
        assert_eq!(config.ws_port, 16000);
    }

    #[test]
    fn missing_working_directory_is_rejected() {
        let err = Config::load(Path::new("/nonexistent/jsx-tool-test"), ConfigOverlay::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidWorkingDirectory { .. }));
    }

    #[test]
    fn protocols_parse_and_display() {
        assert_eq!("https".parse::<HttpProtocol>().unwrap(), HttpProtocol::Https);
        assert_eq!("wss".parse::<WsProtocol>().unwrap(), WsProtocol::Wss);
        assert!("spdy".parse::<HttpProtocol>().is_err());
        assert_eq!(HttpProtocol::Http.to_string(), "http");
    }
}
