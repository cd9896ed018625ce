//! Global config singleton. Load settings.json once; the server binary calls
//! `ensure_loaded()` so the first caller does the work, later callers get the
//! same instance. CLI flags override individual fields at startup.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default listening port for the WebSocket endpoint.
pub const DEFAULT_PORT: u16 = 3000;

/// Default scrollback cap in bytes (roughly 10 000 lines of output).
pub const DEFAULT_SCROLLBACK_BYTES: usize = 2_000_000;

/// Root directory for config: settings.json lives here (workspace root when
/// common is in core/).
fn config_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("..")
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Cached config from settings.json.
pub struct Config {
    /// Port the server listens on. Default: 3000.
    pub port: u16,
    /// Scrollback cap per session, in bytes.
    pub scrollback_bytes: usize,
    /// Shell binary for new sessions. Default: $SHELL, then /bin/bash.
    pub shell: Option<String>,
}

/// Ensure config is loaded (idempotent). Loads settings.json on first call;
/// returns the same instance afterwards.
pub fn ensure_loaded() -> &'static Config {
    CONFIG.get_or_init(|| {
        let path = config_root().join("settings.json");
        load_settings_from(&path)
    })
}

fn load_settings_from(path: &std::path::Path) -> Config {
    let Ok(data) = std::fs::read_to_string(path) else {
        return Config::default();
    };
    let Ok(root) = serde_json::from_str::<serde_json::Value>(&data) else {
        return Config::default();
    };

    let port = root
        .get("port")
        .and_then(|v| v.as_u64())
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(DEFAULT_PORT);

    let scrollback_bytes = root
        .get("scrollback_bytes")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_SCROLLBACK_BYTES);

    let shell = root
        .get("shell")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    Config {
        port,
        scrollback_bytes,
        shell,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            shell: None,
        }
    }
}
