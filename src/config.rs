use std::path::PathBuf;

/// Process-level configuration resolved from environment variables at
/// startup. Settings persisted per profile can be overridden here; the
/// env always wins for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// `false` when the bridge is disabled via `DEV_WS_BRIDGE` /
    /// `DEV_WS_BRIDGE_DISABLE`. `None` means "defer to settings".
    pub bridge_enabled: Option<bool>,
    pub bridge_port: Option<u16>,
    pub bridge_http_port: Option<u16>,
    pub bridge_token: Option<String>,
    /// Profile root override (`BIOVAULT_HOME`).
    pub home: Option<PathBuf>,
    /// Config root override (`BIOVAULT_CONFIG`), where `config.yaml` lives.
    pub config_root: Option<PathBuf>,
    pub syftbox_server_url: Option<String>,
    pub syftbox_config_path: Option<PathBuf>,
    pub syftbox_data_dir: Option<PathBuf>,
    pub syftbox_binary: Option<String>,
    pub syftbox_version: Option<String>,
    pub syftbox_backend: Option<SyftboxBackendKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyftboxBackendKind {
    Embedded,
    Process,
}

impl SyftboxBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyftboxBackendKind::Embedded => "embedded",
            SyftboxBackendKind::Process => "process",
        }
    }
}

fn truthy(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

fn falsy(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no")
}

impl EnvConfig {
    /// Default WS port when neither env nor settings specify one.
    pub const DEFAULT_WS_PORT: u16 = 3333;
    /// Default HTTP fallback port.
    pub const DEFAULT_HTTP_PORT: u16 = 3334;

    pub fn from_env() -> Self {
        let get = |key: &str| std::env::var(key).ok();
        Self::from_raw_values(
            get("DEV_WS_BRIDGE").as_deref(),
            get("DEV_WS_BRIDGE_DISABLE").as_deref(),
            get("DEV_WS_BRIDGE_PORT").as_deref(),
            get("DEV_WS_BRIDGE_HTTP_PORT").as_deref(),
            get("AGENT_BRIDGE_TOKEN").as_deref(),
            get("BIOVAULT_HOME").as_deref(),
            get("BIOVAULT_CONFIG").as_deref(),
            get("SYFTBOX_SERVER_URL").as_deref(),
            get("SYFTBOX_CONFIG_PATH").as_deref(),
            get("SYFTBOX_DATA_DIR").as_deref(),
            get("SYFTBOX_BINARY").as_deref(),
            get("SYFTBOX_VERSION").as_deref(),
            get("BV_SYFTBOX_BACKEND").as_deref(),
        )
    }

    /// Build an EnvConfig from raw string values (as they would come from
    /// env vars). Used directly in tests to avoid mutating process-global
    /// environment.
    #[allow(clippy::too_many_arguments)]
    pub fn from_raw_values(
        ws_bridge: Option<&str>,
        ws_bridge_disable: Option<&str>,
        ws_bridge_port: Option<&str>,
        ws_bridge_http_port: Option<&str>,
        bridge_token: Option<&str>,
        home: Option<&str>,
        config_root: Option<&str>,
        server_url: Option<&str>,
        syftbox_config_path: Option<&str>,
        syftbox_data_dir: Option<&str>,
        syftbox_binary: Option<&str>,
        syftbox_version: Option<&str>,
        syftbox_backend: Option<&str>,
    ) -> Self {
        // DEV_WS_BRIDGE=0|false|no disables; DEV_WS_BRIDGE_DISABLE=1|true|yes
        // force-disables even if DEV_WS_BRIDGE says otherwise.
        let bridge_enabled = if ws_bridge_disable.is_some_and(truthy) {
            Some(false)
        } else if ws_bridge.is_some_and(falsy) {
            Some(false)
        } else if ws_bridge.is_some_and(truthy) {
            Some(true)
        } else {
            None
        };

        let non_empty = |v: Option<&str>| v.filter(|s| !s.is_empty()).map(String::from);
        let path = |v: Option<&str>| v.filter(|s| !s.is_empty()).map(PathBuf::from);

        EnvConfig {
            bridge_enabled,
            bridge_port: ws_bridge_port.and_then(|v| v.parse().ok()),
            bridge_http_port: ws_bridge_http_port.and_then(|v| v.parse().ok()),
            bridge_token: non_empty(bridge_token),
            home: path(home),
            config_root: path(config_root),
            syftbox_server_url: non_empty(server_url),
            syftbox_config_path: path(syftbox_config_path),
            syftbox_data_dir: path(syftbox_data_dir),
            syftbox_binary: non_empty(syftbox_binary),
            syftbox_version: non_empty(syftbox_version),
            syftbox_backend: syftbox_backend.and_then(|v| match v.trim() {
                "embedded" => Some(SyftboxBackendKind::Embedded),
                "process" => Some(SyftboxBackendKind::Process),
                _ => None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from(ws: Option<&str>, disable: Option<&str>) -> EnvConfig {
        EnvConfig::from_raw_values(
            ws, disable, None, None, None, None, None, None, None, None, None, None, None,
        )
    }

    #[test]
    fn bridge_defaults_to_settings() {
        assert_eq!(from(None, None).bridge_enabled, None);
    }

    #[test]
    fn ws_bridge_zero_disables() {
        assert_eq!(from(Some("0"), None).bridge_enabled, Some(false));
        assert_eq!(from(Some("false"), None).bridge_enabled, Some(false));
        assert_eq!(from(Some("no"), None).bridge_enabled, Some(false));
    }

    #[test]
    fn ws_bridge_one_enables() {
        assert_eq!(from(Some("1"), None).bridge_enabled, Some(true));
    }

    #[test]
    fn force_disable_wins_over_enable() {
        assert_eq!(from(Some("1"), Some("true")).bridge_enabled, Some(false));
        assert_eq!(from(None, Some("yes")).bridge_enabled, Some(false));
    }

    #[test]
    fn invalid_port_is_ignored() {
        let cfg = EnvConfig::from_raw_values(
            None,
            None,
            Some("not-a-number"),
            Some("4444"),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        );
        assert_eq!(cfg.bridge_port, None);
        assert_eq!(cfg.bridge_http_port, Some(4444));
    }

    #[test]
    fn empty_token_is_none() {
        let cfg = EnvConfig::from_raw_values(
            None,
            None,
            None,
            None,
            Some(""),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        );
        assert!(cfg.bridge_token.is_none());
    }

    #[test]
    fn backend_selector_parses() {
        let cfg = EnvConfig::from_raw_values(
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            Some("process"),
        );
        assert_eq!(cfg.syftbox_backend, Some(SyftboxBackendKind::Process));
        let cfg = EnvConfig::from_raw_values(
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            Some("bogus"),
        );
        assert_eq!(cfg.syftbox_backend, None);
    }
}
