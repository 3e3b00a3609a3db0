use agenda_protocol::MAX_MESSAGE_BYTES;
use agenda_protocol::model::{Availability, WeekdayIndex};
use anyhow::{Context, Result, bail};
use chrono::NaiveTime;
use libagenda::ManagerSettings;
use libagenda::cipher::CipherSettings;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WebConfig {
    pub listen: SocketAddr,
    /// SQLite file; in memory when unset.
    pub db_path: Option<PathBuf>,
    /// Allowed `Origin` values for CORS and WebSocket upgrades. `"*"` allows any.
    pub allow_origins: Vec<String>,
    /// Take the requester address from `X-Forwarded-For` when present.
    pub trust_forwarded_for: bool,
    /// Read deadline without a pong; pings go out at 9/10 of this.
    pub keepalive_secs: u64,
    pub event_timeout_secs: u64,
    pub queue_capacity: usize,
    pub max_message_bytes: usize,
    pub notify_capacity: usize,
    /// JSON document served at `/about`.
    pub about_path: Option<PathBuf>,
    pub cipher: CipherSettings,
    pub mail: MailConfig,
    /// Availability installed as the newest set at startup, when non-empty.
    pub availability: Vec<AvailabilitySeed>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct MailConfig {
    /// HTTP mail relay; notifications are only logged when unset.
    pub endpoint: Option<String>,
    pub owner_address: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AvailabilitySeed {
    pub weekday: WeekdayIndex,
    pub from: NaiveTime,
    pub to: NaiveTime,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            db_path: None,
            allow_origins: vec!["http://localhost:3000".to_string()],
            trust_forwarded_for: false,
            keepalive_secs: 10,
            event_timeout_secs: 10,
            queue_capacity: 64,
            max_message_bytes: MAX_MESSAGE_BYTES,
            notify_capacity: 32,
            about_path: None,
            cipher: CipherSettings::default(),
            mail: MailConfig::default(),
            availability: Vec::new(),
        }
    }
}

impl WebConfig {
    /// Load from `path` if given, otherwise defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("invalid config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.keepalive_secs == 0 || self.event_timeout_secs == 0 {
            bail!("keepalive_secs and event_timeout_secs must be > 0");
        }
        if self.queue_capacity == 0 || self.notify_capacity == 0 {
            bail!("queue capacities must be > 0");
        }
        if self.max_message_bytes == 0 {
            bail!("max_message_bytes must be > 0");
        }
        for seed in &self.availability {
            if seed.weekday > 6 {
                bail!("availability weekday {} out of range 0-6", seed.weekday);
            }
            if seed.to < seed.from {
                bail!("availability for weekday {} ends before it starts", seed.weekday);
            }
        }
        Ok(())
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        self.keepalive() * 9 / 10
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            queue_capacity: self.queue_capacity,
            event_timeout: Duration::from_secs(self.event_timeout_secs),
            notify_capacity: self.notify_capacity,
        }
    }

    pub fn availability_rows(&self) -> Vec<Availability> {
        self.availability
            .iter()
            .map(|seed| Availability::new(seed.weekday, seed.from, seed.to))
            .collect()
    }
}
