//! Backend session: connection settings, wait tuning, and the established
//! capability handles that every resolution and operation runs against.

use crate::backend::{
    BackendHandles, Connector, ControlBackend, GuestBackend, InventoryBackend,
};
use crate::error::InventoryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How long the operations wait for the backend and its guests, in seconds.
/// Zero-valued polls check once per loop turn without sleeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitPolicy {
    /// Interval between task status polls.
    #[serde(default = "default_task_poll_secs")]
    pub task_poll_secs: u64,
    /// Deadline for ordinary control tasks. `None` waits indefinitely.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: Option<u64>,
    /// Deadline for clone tasks, which legitimately run long.
    #[serde(default)]
    pub clone_timeout_secs: Option<u64>,
    /// Deadline for a guest shutdown task when the backend hands one back.
    #[serde(default = "default_soft_off_timeout_secs")]
    pub soft_off_timeout_secs: u64,
    /// Grace period before polling power state after a guest shutdown
    /// request that produced no task.
    #[serde(default = "default_soft_off_grace_secs")]
    pub soft_off_grace_secs: u64,
    /// Interval between power-state and tools-state polls.
    #[serde(default = "default_state_poll_secs")]
    pub state_poll_secs: u64,
    /// How long a state may stay unchanged before the entity is re-fetched
    /// in case the cached managed-object reference went stale.
    #[serde(default = "default_stall_window_secs")]
    pub stall_window_secs: u64,
    /// Re-fetches tolerated while waiting for a guest to power off.
    #[serde(default = "default_power_off_refresh_limit")]
    pub power_off_refresh_limit: u32,
    /// Re-fetches tolerated while waiting for the in-guest agent to come up.
    #[serde(default = "default_tools_refresh_limit")]
    pub tools_refresh_limit: u32,
    /// Reboot requests issued before the guest is declared unrebootable.
    #[serde(default = "default_reboot_attempts")]
    pub reboot_attempts: u32,
    /// Delay before retrying a reboot request the backend rejected.
    #[serde(default = "default_reboot_retry_delay_secs")]
    pub reboot_retry_delay_secs: u64,
    /// How long to watch for the in-guest agent to drop after a reboot
    /// request was accepted.
    #[serde(default = "default_reboot_observe_secs")]
    pub reboot_observe_secs: u64,
    /// Deadline for the guest OS to report running again after a reboot.
    #[serde(default = "default_guest_state_timeout_secs")]
    pub guest_state_timeout_secs: u64,
    /// Interval between in-guest process polls.
    #[serde(default = "default_guest_poll_secs")]
    pub guest_poll_secs: u64,
}

fn default_task_poll_secs() -> u64 {
    10
}

fn default_task_timeout_secs() -> Option<u64> {
    Some(60)
}

fn default_soft_off_timeout_secs() -> u64 {
    240
}

fn default_soft_off_grace_secs() -> u64 {
    20
}

fn default_state_poll_secs() -> u64 {
    5
}

fn default_stall_window_secs() -> u64 {
    120
}

fn default_power_off_refresh_limit() -> u32 {
    5
}

fn default_tools_refresh_limit() -> u32 {
    10
}

fn default_reboot_attempts() -> u32 {
    5
}

fn default_reboot_retry_delay_secs() -> u64 {
    30
}

fn default_reboot_observe_secs() -> u64 {
    120
}

fn default_guest_state_timeout_secs() -> u64 {
    1800
}

fn default_guest_poll_secs() -> u64 {
    5
}

impl Default for WaitPolicy {
    fn default() -> Self {
        WaitPolicy {
            task_poll_secs: default_task_poll_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            clone_timeout_secs: None,
            soft_off_timeout_secs: default_soft_off_timeout_secs(),
            soft_off_grace_secs: default_soft_off_grace_secs(),
            state_poll_secs: default_state_poll_secs(),
            stall_window_secs: default_stall_window_secs(),
            power_off_refresh_limit: default_power_off_refresh_limit(),
            tools_refresh_limit: default_tools_refresh_limit(),
            reboot_attempts: default_reboot_attempts(),
            reboot_retry_delay_secs: default_reboot_retry_delay_secs(),
            reboot_observe_secs: default_reboot_observe_secs(),
            guest_state_timeout_secs: default_guest_state_timeout_secs(),
            guest_poll_secs: default_guest_poll_secs(),
        }
    }
}

impl WaitPolicy {
    /// Every interval and window zeroed, every retry limit kept. Polls spin
    /// without sleeping; suited to the in-memory backend.
    pub fn immediate() -> Self {
        WaitPolicy {
            task_poll_secs: 0,
            task_timeout_secs: Some(0),
            clone_timeout_secs: None,
            soft_off_timeout_secs: 0,
            soft_off_grace_secs: 0,
            state_poll_secs: 0,
            stall_window_secs: 0,
            reboot_retry_delay_secs: 0,
            reboot_observe_secs: 0,
            guest_state_timeout_secs: 0,
            guest_poll_secs: 0,
            ..WaitPolicy::default()
        }
    }

    pub fn task_poll(&self) -> Duration {
        Duration::from_secs(self.task_poll_secs)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    pub fn clone_timeout(&self) -> Option<Duration> {
        self.clone_timeout_secs.map(Duration::from_secs)
    }

    pub fn soft_off_timeout(&self) -> Duration {
        Duration::from_secs(self.soft_off_timeout_secs)
    }

    pub fn soft_off_grace(&self) -> Duration {
        Duration::from_secs(self.soft_off_grace_secs)
    }

    pub fn state_poll(&self) -> Duration {
        Duration::from_secs(self.state_poll_secs)
    }

    pub fn stall_window(&self) -> Duration {
        Duration::from_secs(self.stall_window_secs)
    }

    pub fn reboot_retry_delay(&self) -> Duration {
        Duration::from_secs(self.reboot_retry_delay_secs)
    }

    pub fn reboot_observe(&self) -> Duration {
        Duration::from_secs(self.reboot_observe_secs)
    }

    pub fn guest_state_timeout(&self) -> Duration {
        Duration::from_secs(self.guest_state_timeout_secs)
    }

    pub fn guest_poll(&self) -> Duration {
        Duration::from_secs(self.guest_poll_secs)
    }
}

/// Connection settings for one backend endpoint.
///
/// Every field is serde-defaulted so layered config files can each be
/// partial; an endpoint or credential left empty is caught by config
/// validation, not here.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    #[serde(default)]
    pub waits: WaitPolicy,
}

fn default_port() -> u16 {
    443
}

fn default_verify_tls() -> bool {
    true
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings::new("", "", "")
    }
}

impl SessionSettings {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        SessionSettings {
            endpoint: endpoint.into(),
            port: default_port(),
            username: username.into(),
            password: password.into(),
            verify_tls: default_verify_tls(),
            waits: WaitPolicy::default(),
        }
    }

    pub fn with_waits(mut self, waits: WaitPolicy) -> Self {
        self.waits = waits;
        self
    }

    /// Section validation used by the config loader.
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint.is_empty() {
            return Err("endpoint must not be empty".to_string());
        }
        if self.username.is_empty() {
            return Err("username must not be empty".to_string());
        }
        if self.password.is_empty() {
            return Err("password must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("port must not be 0".to_string());
        }
        Ok(())
    }
}

// The password never reaches logs, not even through Debug formatting.
impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("endpoint", &self.endpoint)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("verify_tls", &self.verify_tls)
            .field("waits", &self.waits)
            .finish()
    }
}

/// An established backend session: the settings it was opened with plus the
/// capability handles the connector produced.
///
/// Sessions are externally managed. This type never reconnects on its own;
/// a broken session surfaces as `BackendUnavailable` from whichever call
/// hit it first.
pub struct Session {
    settings: SessionSettings,
    backends: BackendHandles,
    established_at: DateTime<Utc>,
}

impl Session {
    /// Wrap pre-built capability handles, for callers that already hold a
    /// connected backend.
    pub fn new(settings: SessionSettings, backends: BackendHandles) -> Self {
        Session {
            settings,
            backends,
            established_at: Utc::now(),
        }
    }

    /// Connect through `connector` and wrap the resulting handles.
    pub async fn establish(
        connector: &dyn Connector,
        settings: SessionSettings,
    ) -> Result<Self, InventoryError> {
        debug!(
            endpoint = %settings.endpoint,
            port = settings.port,
            username = %settings.username,
            "Establishing backend session"
        );
        let backends = connector.connect(&settings).await?;
        info!(endpoint = %settings.endpoint, "Backend session established");
        Ok(Session::new(settings, backends))
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn waits(&self) -> &WaitPolicy {
        &self.settings.waits
    }

    pub fn inventory(&self) -> &Arc<dyn InventoryBackend> {
        &self.backends.inventory
    }

    pub fn control(&self) -> &Arc<dyn ControlBackend> {
        &self.backends.control
    }

    pub fn guest(&self) -> &Arc<dyn GuestBackend> {
        &self.backends.guest
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }
}
