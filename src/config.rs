use std::{env, time::Duration};

/// Controller settings, read once from the environment at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Converge a VirtualService routing entry per session (`USE_INGRESS`).
    pub use_ingress: bool,
    /// Gateway the routing entry attaches to (`INGRESS_GATEWAY`).
    pub ingress_gateway: String,
    /// Default a supplementary fsGroup of 100 onto pod security contexts
    /// unless the template brings its own (`ADD_FSGROUP`).
    pub add_fsgroup: bool,
    /// Idle-culling gate (`ENABLE_CULLING`).
    pub enable_culling: bool,
    /// Inactivity window after which a session is idled (`CULL_IDLE_TIME`, minutes).
    pub idle_time: Duration,
    /// Polling cadence for idleness checks (`IDLENESS_CHECK_PERIOD`, minutes).
    pub cull_period: Duration,
}

pub const DEFAULT_INGRESS_GATEWAY: &str = "system/default-gateway";
const DEFAULT_CULL_IDLE_MINUTES: u64 = 1440;
const DEFAULT_CHECK_PERIOD_MINUTES: u64 = 1;

impl Default for Settings {
    fn default() -> Self {
        Settings {
            use_ingress: false,
            ingress_gateway: DEFAULT_INGRESS_GATEWAY.to_string(),
            add_fsgroup: true,
            enable_culling: true,
            idle_time: Duration::from_secs(DEFAULT_CULL_IDLE_MINUTES * 60),
            cull_period: Duration::from_secs(DEFAULT_CHECK_PERIOD_MINUTES * 60),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Settings {
            use_ingress: env_flag("USE_INGRESS", defaults.use_ingress),
            ingress_gateway: env::var("INGRESS_GATEWAY").unwrap_or(defaults.ingress_gateway),
            add_fsgroup: env_flag("ADD_FSGROUP", defaults.add_fsgroup),
            enable_culling: env_flag("ENABLE_CULLING", defaults.enable_culling),
            idle_time: env_minutes("CULL_IDLE_TIME", defaults.idle_time),
            cull_period: env_minutes("IDLENESS_CHECK_PERIOD", defaults.cull_period),
        }
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => v.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

fn env_minutes(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(|m| Duration::from_secs(m * 60))
        .unwrap_or(default)
}
