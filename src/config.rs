#![forbid(unsafe_code)]

// Server configuration from environment variables

use crate::session::SessionLimits;
use crate::turn::TurnConfig;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_MEDIA_REQUEST_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    pub limits: SessionLimits,
    /// Bound on every call into the media engine
    pub media_request_timeout: Duration,
    /// Whether the actor receives its own mute/camera broadcast
    pub control_echo_to_sender: bool,
    /// Bearer token guarding `/metrics`
    pub metrics_token: Option<String>,
    pub announce_ip: IpAddr,
    pub turn: Option<TurnConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            limits: SessionLimits::default(),
            media_request_timeout: Duration::from_millis(DEFAULT_MEDIA_REQUEST_TIMEOUT_MS),
            control_echo_to_sender: true,
            metrics_token: None,
            announce_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            turn: None,
        }
    }
}

impl ServerConfig {
    /// Reads the process environment. Invalid values fall back to defaults with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let limits = SessionLimits {
            max_participants: parse_nonzero(&lookup, "MAX_PARTICIPANTS_PER_SESSION", defaults.limits.max_participants),
            max_consumers_per_participant: parse_nonzero(
                &lookup,
                "MAX_CONSUMERS_PER_PARTICIPANT",
                defaults.limits.max_consumers_per_participant,
            ),
        };

        Self {
            port: parse_or(&lookup, "PORT", defaults.port),
            max_connections: parse_nonzero(&lookup, "MAX_CONNECTIONS", defaults.max_connections),
            limits,
            media_request_timeout: Duration::from_millis(parse_nonzero(
                &lookup,
                "MEDIA_REQUEST_TIMEOUT_MS",
                DEFAULT_MEDIA_REQUEST_TIMEOUT_MS,
            )),
            control_echo_to_sender: parse_flag(&lookup, "CONTROL_ECHO_TO_SENDER", defaults.control_echo_to_sender),
            metrics_token: lookup("METRICS_TOKEN").filter(|token| !token.is_empty()),
            announce_ip: parse_or(&lookup, "ANNOUNCE_IP", defaults.announce_ip),
            turn: TurnConfig::from_lookup(&lookup),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid {}={:?}, using {}", key, raw, default);
            default
        }),
        None => default,
    }
}

/// As [`parse_or`], also rejecting zero
fn parse_nonzero<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display + PartialEq + Default + Copy,
{
    let value = parse_or(lookup, key, default);
    if value == T::default() {
        warn!("{}=0 is not allowed, using {}", key, default);
        return default;
    }
    value
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key).as_deref().map(str::trim) {
        None => default,
        Some("1" | "true" | "TRUE" | "yes") => true,
        Some("0" | "false" | "FALSE" | "no") => false,
        Some(raw) => {
            warn!("Invalid {}={:?}, using {}", key, raw, default);
            default
        }
    }
}
