//! Backend identity, live status and selection.
//!
//! Pure functions used by the registry in `canvasflow-pipeline`; no I/O.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{BackendId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default ComfyUI listen port.
pub const DEFAULT_BACKEND_PORT: u16 = 8188;

/// Seconds between health polls when not configured.
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 15;

/// Maximum length of a backend id.
const MAX_ID_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// Static identity of a render backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: BackendId,
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Bearer token supplied by the external credential store.
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_BACKEND_PORT
}

fn default_enabled() -> bool {
    true
}

impl BackendConfig {
    pub fn new(id: impl Into<BackendId>, host: impl Into<String>, port: u16) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            host: host.into(),
            port,
            use_tls: false,
            capabilities: Vec::new(),
            enabled: true,
            auth_token: None,
        }
    }

    /// Base URL for the REST API, e.g. `http://host:8188`.
    pub fn http_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// URL of the event WebSocket, e.g. `ws://host:8188/ws`.
    pub fn ws_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{scheme}://{}:{}/ws", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        validate_backend_id(&self.id)?;
        if self.host.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "Backend \"{}\" has an empty host",
                self.id
            )));
        }
        Ok(())
    }
}

/// Live state of a backend, written by the health monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub online: bool,
    pub queue_depth: u32,
    pub vram_free: u64,
    pub vram_total: u64,
    pub last_seen: Option<Timestamp>,
    pub last_error: Option<String>,
}

impl BackendStatus {
    pub fn offline(error: impl Into<String>) -> Self {
        Self {
            online: false,
            last_error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// A backend as seen by the selector.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCandidate {
    pub config: BackendConfig,
    pub status: BackendStatus,
}

impl BackendCandidate {
    pub fn is_available(&self) -> bool {
        self.config.enabled && self.status.online
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Constraints for one backend selection.
#[derive(Debug, Clone, Default)]
pub struct SelectionRequest<'a> {
    /// Node-level affinity; honoured when that backend is available.
    pub affinity: Option<&'a str>,
    /// Configured default backend; tried after affinity.
    pub default_backend: Option<&'a str>,
    pub required_capabilities: &'a [String],
    /// Backends that must not be chosen (e.g. the one that just failed).
    pub exclude: &'a [BackendId],
}

/// Count how many of `required` capabilities `available` offers.
pub fn count_matching_capabilities(available: &[String], required: &[String]) -> usize {
    required
        .iter()
        .filter(|req| available.iter().any(|c| c == *req))
        .count()
}

/// Pick a backend: affinity, then the default, then the least queued
/// backend (ties broken by most free VRAM, then id). Returns `None` when no
/// backend is online, enabled, capable and not excluded.
pub fn select_backend<'c>(
    candidates: &'c [BackendCandidate],
    request: &SelectionRequest<'_>,
) -> Option<&'c BackendCandidate> {
    let eligible = |c: &&BackendCandidate| {
        c.is_available()
            && !request.exclude.contains(&c.config.id)
            && count_matching_capabilities(&c.config.capabilities, request.required_capabilities)
                == request.required_capabilities.len()
    };

    for preferred in [request.affinity, request.default_backend].into_iter().flatten() {
        if let Some(found) = candidates
            .iter()
            .filter(eligible)
            .find(|c| c.config.id == preferred)
        {
            return Some(found);
        }
    }

    candidates.iter().filter(eligible).min_by(|a, b| compare_load(a, b))
}

fn compare_load(a: &BackendCandidate, b: &BackendCandidate) -> Ordering {
    a.status
        .queue_depth
        .cmp(&b.status.queue_depth)
        .then_with(|| b.status.vram_free.cmp(&a.status.vram_free))
        .then_with(|| a.config.id.cmp(&b.config.id))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a backend id.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_ID_LEN` characters.
/// - Must contain only alphanumeric, hyphen, underscore, or dot characters.
pub fn validate_backend_id(id: &str) -> Result<(), CoreError> {
    if id.is_empty() {
        return Err(CoreError::Validation(
            "Backend id must not be empty".to_string(),
        ));
    }
    if id.len() > MAX_ID_LEN {
        return Err(CoreError::Validation(format!(
            "Backend id must not exceed {MAX_ID_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CoreError::Validation(
            "Backend id may only contain alphanumeric, hyphen, underscore, or dot characters"
                .to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
