use std::{fs, path::PathBuf, sync::RwLock};

use dirs::data_dir;
use once_cell::sync::Lazy;

/// Default quota units per USD when `QUOTA_PER_UNIT` is unset.
pub const DEFAULT_QUOTA_PER_USD: i64 = 500_000;

#[derive(serde::Serialize, serde::Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    /// Port the gateway binds to. Overridden by `--port`.
    pub port: u16,
    /// Directory holding the SQLite database and log tables. Overridden by `--log-dir`.
    pub data_dir: Option<String>,
    /// Outbound proxy URL for upstream API calls (`RELAY_PROXY`).
    pub relay_proxy: Option<String>,
    /// Outbound proxy URL for fetching user-supplied media (`USER_CONTENT_REQUEST_PROXY`).
    pub user_content_proxy: Option<String>,
    /// Total upstream deadline in seconds; 0 disables the deadline (`RELAY_TIMEOUT`).
    pub relay_timeout_secs: u64,
    /// Whether the format auto-detector middleware is active (`AUTO_DETECT_API_FORMAT`).
    pub auto_detect_format: bool,
    /// `transparent` re-enters the canonical handler; `redirect` answers 302
    /// (`AUTO_DETECT_API_FORMAT_ACTION`).
    pub auto_detect_action: AutoDetectAction,
    /// Deadline for the detached post-consume task (`BILLING_TIMEOUT_SEC`).
    pub billing_timeout_secs: u64,
    /// Quota units per USD (`QUOTA_PER_UNIT`).
    pub quota_per_usd: i64,
    /// Render quota amounts as USD in log content strings (`DISPLAY_IN_CURRENCY`).
    pub display_in_currency: bool,
    /// Requests-per-minute cap per token; None disables the limiter.
    pub rpm_limit: Option<u32>,
    /// Concurrent in-flight requests per user; None disables the cap.
    pub max_concurrent_per_user: Option<u32>,
    /// Minimum log level persisted ("debug" | "info" | "warn" | "error").
    pub log_level: String,
    /// SMTP settings for the external notifier; the gateway never sends mail itself.
    pub smtp: SmtpConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 3000,
            data_dir: None,
            relay_proxy: None,
            user_content_proxy: None,
            relay_timeout_secs: 0,
            auto_detect_format: true,
            auto_detect_action: AutoDetectAction::Transparent,
            billing_timeout_secs: 30,
            quota_per_usd: DEFAULT_QUOTA_PER_USD,
            display_in_currency: false,
            rpm_limit: None,
            max_concurrent_per_user: None,
            log_level: "info".to_string(),
            smtp: SmtpConfig::default(),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AutoDetectAction {
    Transparent,
    Redirect,
}

impl AutoDetectAction {
    fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transparent" => Some(AutoDetectAction::Transparent),
            "redirect" => Some(AutoDetectAction::Redirect),
            _ => None,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Default)]
#[serde(default)]
pub struct SmtpConfig {
    pub server: Option<String>,
    pub port: Option<u16>,
    pub account: Option<String>,
    pub token: Option<String>,
    pub from: Option<String>,
    /// `FORCE_EMAIL_TLS_VERIFY`
    pub force_tls_verify: bool,
}

static SETTINGS: Lazy<RwLock<Settings>> = Lazy::new(|| RwLock::new(Settings::default()));

fn default_settings_path() -> PathBuf {
    let mut p = data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("modelgate");
    fs::create_dir_all(&p).ok();
    p.push("modelgate.toml");
    p
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut Settings) {
    if let Some(v) = env_nonempty("RELAY_PROXY") {
        cfg.relay_proxy = Some(v);
    }
    if let Some(v) = env_nonempty("USER_CONTENT_REQUEST_PROXY") {
        cfg.user_content_proxy = Some(v);
    }
    if let Some(v) = env_nonempty("RELAY_TIMEOUT").and_then(|v| v.parse().ok()) {
        cfg.relay_timeout_secs = v;
    }
    if let Some(v) = env_nonempty("AUTO_DETECT_API_FORMAT").and_then(|v| parse_bool(&v)) {
        cfg.auto_detect_format = v;
    }
    if let Some(v) =
        env_nonempty("AUTO_DETECT_API_FORMAT_ACTION").and_then(|v| AutoDetectAction::from_str(&v))
    {
        cfg.auto_detect_action = v;
    }
    if let Some(v) = env_nonempty("BILLING_TIMEOUT_SEC").and_then(|v| v.parse().ok()) {
        cfg.billing_timeout_secs = v;
    }
    if let Some(v) = env_nonempty("QUOTA_PER_UNIT").and_then(|v| v.parse().ok()) {
        cfg.quota_per_usd = v;
    }
    if let Some(v) = env_nonempty("DISPLAY_IN_CURRENCY").and_then(|v| parse_bool(&v)) {
        cfg.display_in_currency = v;
    }
    if let Some(v) = env_nonempty("SMTP_SERVER") {
        cfg.smtp.server = Some(v);
    }
    if let Some(v) = env_nonempty("SMTP_PORT").and_then(|v| v.parse().ok()) {
        cfg.smtp.port = Some(v);
    }
    if let Some(v) = env_nonempty("SMTP_ACCOUNT") {
        cfg.smtp.account = Some(v);
    }
    if let Some(v) = env_nonempty("SMTP_TOKEN") {
        cfg.smtp.token = Some(v);
    }
    if let Some(v) = env_nonempty("SMTP_FROM") {
        cfg.smtp.from = Some(v);
    }
    if let Some(v) = env_nonempty("FORCE_EMAIL_TLS_VERIFY").and_then(|v| parse_bool(&v)) {
        cfg.smtp.force_tls_verify = v;
    }
}

/// Read the settings file (if any), apply environment overrides, and install
/// the result as the process-wide snapshot.
pub fn init(path: Option<&std::path::Path>) -> Settings {
    let p = path.map(PathBuf::from).unwrap_or_else(default_settings_path);
    let mut cfg = if p.exists() {
        let s = fs::read_to_string(&p).unwrap_or_default();
        toml::from_str(&s).unwrap_or_else(|e| {
            eprintln!("failed to parse config {:?}: {}", p, e);
            Settings::default()
        })
    } else {
        Settings::default()
    };

    apply_env_overrides(&mut cfg);
    *SETTINGS.write().unwrap() = cfg.clone();
    cfg
}

/// Current settings snapshot. Cheap clone; callers may hold it across awaits.
pub fn load() -> Settings {
    SETTINGS.read().unwrap().clone()
}

/// Replace the snapshot. Used by tests and by hot-reload.
pub fn install(cfg: Settings) {
    *SETTINGS.write().unwrap() = cfg;
}

/// Serializes tests that install process-wide settings.
#[cfg(test)]
pub mod test_support {
    use once_cell::sync::Lazy;
    use std::sync::{Mutex, MutexGuard};

    static SETTINGS_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    pub fn lock() -> MutexGuard<'static, ()> {
        SETTINGS_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Settings::default();
        assert_eq!(cfg.quota_per_usd, DEFAULT_QUOTA_PER_USD);
        assert!(cfg.auto_detect_format);
        assert_eq!(cfg.auto_detect_action, AutoDetectAction::Transparent);
        assert_eq!(cfg.billing_timeout_secs, 30);
    }

    #[test]
    fn parse_action() {
        assert_eq!(
            AutoDetectAction::from_str("redirect"),
            Some(AutoDetectAction::Redirect)
        );
        assert_eq!(
            AutoDetectAction::from_str(" Transparent "),
            Some(AutoDetectAction::Transparent)
        );
        assert_eq!(AutoDetectAction::from_str("bounce"), None);
    }

    #[test]
    fn parse_bools() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
