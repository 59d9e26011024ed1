use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const GOOGLE_STUN_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            username: None,
            credential: None,
        }
    }
}

/// Bounded fixed-interval retry: `max_attempts` further checks, `interval_ms` apart,
/// after an initial immediate check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const fn new(interval_ms: u64, max_attempts: u32) -> Self {
        Self {
            interval_ms,
            max_attempts,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Upper bound on how long [`RetryPolicy::poll`] can suspend
    pub fn budget(&self) -> Duration {
        self.interval()
            .checked_mul(self.max_attempts)
            .unwrap_or(Duration::MAX)
    }

    /// Calls `probe` until it yields a value. Fails with the number of attempts made
    /// once the policy is exhausted.
    pub async fn poll<T, F>(&self, mut probe: F) -> Result<T, u32>
    where
        F: FnMut() -> Option<T>,
    {
        if let Some(value) = probe() {
            return Ok(value);
        }
        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.interval()).await;
            if let Some(value) = probe() {
                log::trace!("retry policy satisfied after {attempt} attempts");
                return Ok(value);
            }
        }
        Err(self.max_attempts)
    }
}

/// Tuning for the room orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MeshConfig {
    // plain values must precede tables for the toml serializer
    /// pause between successive session creations while handling a membership snapshot
    pub room_info_stagger_ms: u64,
    /// announce camera on/off to the room and track it for remote participants
    pub broadcast_video_state: bool,
    /// let the offering side restart ICE once the transport fails
    pub ice_restart_on_failure: bool,
    /// waiting for local media to become ready
    pub media_wait: RetryPolicy,
    /// waiting for a session to return to a neutral state when an offer arrives mid-negotiation
    pub negotiation_retry: RetryPolicy,
    pub ice_servers: Vec<IceServer>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            room_info_stagger_ms: 50,
            broadcast_video_state: false,
            ice_restart_on_failure: false,
            media_wait: RetryPolicy::new(100, 30),
            negotiation_retry: RetryPolicy::new(100, 1),
            ice_servers: vec![IceServer::stun(GOOGLE_STUN_SERVERS)],
        }
    }
}

impl MeshConfig {
    /// Local testing: no STUN lookups and no artificial pauses
    pub fn development() -> Self {
        Self {
            ice_servers: vec![],
            room_info_stagger_ms: 0,
            ..Default::default()
        }
    }

    pub fn production() -> Self {
        Self {
            ice_restart_on_failure: true,
            ..Default::default()
        }
    }

    pub fn room_info_stagger(&self) -> Duration {
        Duration::from_millis(self.room_info_stagger_ms)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        let config: MeshConfig = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String, Error> {
        toml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.media_wait.max_attempts == 0 {
            return Err(Error::Config("media_wait.max_attempts must be at least 1".into()));
        }
        if self.media_wait.interval_ms == 0 {
            return Err(Error::Config("media_wait.interval_ms must be positive".into()));
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() || server.urls.iter().any(|u| u.trim().is_empty()) {
                return Err(Error::Config("ice server urls must not be empty".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn defaults_are_stun_only() {
        let config = MeshConfig::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert!(config.ice_servers[0].urls.iter().all(|u| u.starts_with("stun:")));
        assert!(config.ice_servers[0].username.is_none());
        assert_eq!(config.media_wait, RetryPolicy::new(100, 30));
        assert_eq!(config.negotiation_retry, RetryPolicy::new(100, 1));
        assert!(!config.broadcast_video_state);
        assert!(!config.ice_restart_on_failure);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() -> anyhow::Result<()> {
        let config = MeshConfig::from_toml_str(
            r#"
            broadcast_video_state = true

            [media_wait]
            interval_ms = 50
            max_attempts = 10

            [[ice_servers]]
            urls = ["turn:turn.example.org:3478"]
            username = "user"
            credential = "secret"
            "#,
        )?;
        assert!(config.broadcast_video_state);
        assert_eq!(config.media_wait.budget(), Duration::from_millis(500));
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("user"));
        assert_eq!(config.negotiation_retry, RetryPolicy::new(100, 1));
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = MeshConfig::from_toml_str(
            r#"
            [media_wait]
            interval_ms = 100
            max_attempts = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        assert!(MeshConfig::from_toml_str("ice_servers = 3").is_err());
    }

    #[test]
    fn toml_round_trip_keeps_flags() -> anyhow::Result<()> {
        let config = MeshConfig::production();
        let back = MeshConfig::from_toml_str(&config.to_toml_string()?)?;
        assert_eq!(back, config);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn poll_succeeds_on_third_interval() {
        let policy = RetryPolicy::new(100, 30);
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let result = policy
            .poll(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                (n == 3).then_some(n)
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_gives_up_after_budget() {
        let policy = RetryPolicy::new(100, 30);
        let start = tokio::time::Instant::now();
        let result: Result<(), u32> = policy.poll(|| None).await;
        assert_eq!(result, Err(30));
        assert_eq!(start.elapsed(), policy.budget());
    }

    #[test]
    fn budget_saturates() {
        assert_eq!(RetryPolicy::new(u64::MAX, 2).budget(), Duration::MAX);
        assert_eq!(RetryPolicy::new(250, 4).budget(), Duration::from_secs(1));
    }
}
