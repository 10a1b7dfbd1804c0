//! Balancer policy options resolved from Service annotations.
//!
//! Annotations are free-form strings. [`resolve`] turns them into a
//! [`ConfigurationOptions`] once, at the boundary; nothing downstream ever
//! looks at the raw strings again. A value outside its bounds is rejected,
//! never clamped. An empty value counts as absent.

use std::collections::BTreeMap;
use std::fmt;

use dkcloud_common::{Error, Result};

/// Prefix shared by every recognized annotation
pub const ANNOTATION_PREFIX: &str = "kubernetes.cloud.dk/";

/// Balancing algorithm: `leastconn`, `roundrobin` or `source`
pub const ANNO_ALGORITHM: &str = "kubernetes.cloud.dk/load-balancer-algorithm";
/// Client idle timeout in seconds (1-86400)
pub const ANNO_CLIENT_TIMEOUT: &str = "kubernetes.cloud.dk/load-balancer-client-timeout";
/// Server idle timeout in seconds (1-86400)
pub const ANNO_SERVER_TIMEOUT: &str = "kubernetes.cloud.dk/load-balancer-server-timeout";
/// Maximum concurrent connections across the balancer (1-20000)
pub const ANNO_CONNECTION_LIMIT: &str = "kubernetes.cloud.dk/load-balancer-connection-limit";
/// Send the PROXY protocol header to backends (`true`/`false`)
pub const ANNO_PROXY_PROTOCOL: &str = "kubernetes.cloud.dk/load-balancer-enable-proxy-protocol";
/// Seconds between health checks (3-300)
pub const ANNO_HEALTH_CHECK_INTERVAL: &str =
    "kubernetes.cloud.dk/load-balancer-health-check-interval";
/// Health check timeout in seconds (3-300)
pub const ANNO_HEALTH_CHECK_TIMEOUT: &str = "kubernetes.cloud.dk/load-balancer-health-check-timeout";
/// Consecutive successes before a backend is marked up (2-10)
pub const ANNO_HEALTHY_THRESHOLD: &str =
    "kubernetes.cloud.dk/load-balancer-health-check-threshold-healthy";
/// Consecutive failures before a backend is marked down (2-10)
pub const ANNO_UNHEALTHY_THRESHOLD: &str =
    "kubernetes.cloud.dk/load-balancer-health-check-threshold-unhealthy";
/// Traffic protocol: `tcp`, `http` or `https`
pub const ANNO_PROTOCOL: &str = "kubernetes.cloud.dk/load-balancer-protocol";
/// Health check protocol: `tcp`, `http` or `https` (defaults to the traffic protocol)
pub const ANNO_HEALTH_CHECK_PROTOCOL: &str =
    "kubernetes.cloud.dk/load-balancer-health-check-protocol";
/// Path requested by HTTP health checks
pub const ANNO_HEALTH_CHECK_PATH: &str = "kubernetes.cloud.dk/load-balancer-health-check-path";
/// Session affinity: `none`, `source-ip` or `cookie`
pub const ANNO_STICKY_SESSIONS: &str = "kubernetes.cloud.dk/load-balancer-sticky-sessions";
/// Cookie name for cookie-based affinity
pub const ANNO_STICKY_COOKIE_NAME: &str =
    "kubernetes.cloud.dk/load-balancer-sticky-sessions-cookie-name";

/// How connections are spread across backends
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Algorithm {
    /// Fewest active connections
    LeastConn,
    /// Rotate through backends
    #[default]
    RoundRobin,
    /// Hash of the client address
    Source,
}

impl Algorithm {
    /// HAProxy `balance` keyword
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::LeastConn => "leastconn",
            Algorithm::RoundRobin => "roundrobin",
            Algorithm::Source => "source",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "leastconn" => Some(Algorithm::LeastConn),
            "roundrobin" => Some(Algorithm::RoundRobin),
            "source" => Some(Algorithm::Source),
            _ => None,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application protocol for traffic or health checks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Protocol {
    /// Plain TCP
    #[default]
    Tcp,
    /// HTTP/1.x
    Http,
    /// TLS-wrapped HTTP, passed through untouched
    Https,
}

impl Protocol {
    /// Annotation spelling of the protocol
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "tcp" => Some(Protocol::Tcp),
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session affinity policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StickySessions {
    /// No affinity
    #[default]
    None,
    /// Pin clients by source address
    SourceIp,
    /// Pin clients with an inserted cookie (HTTP only)
    Cookie,
}

impl StickySessions {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(StickySessions::None),
            "source-ip" => Some(StickySessions::SourceIp),
            "cookie" => Some(StickySessions::Cookie),
            _ => None,
        }
    }
}

/// Fully resolved balancer policy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigurationOptions {
    /// Balancing algorithm
    pub algorithm: Algorithm,
    /// Client idle timeout in seconds
    pub client_timeout: u32,
    /// Server idle timeout in seconds
    pub server_timeout: u32,
    /// Maximum concurrent connections across the balancer
    pub connection_limit: u32,
    /// Send the PROXY protocol header to backends
    pub proxy_protocol: bool,
    /// Seconds between health checks
    pub health_check_interval: u32,
    /// Health check timeout in seconds
    pub health_check_timeout: u32,
    /// Consecutive successes before a backend is marked up
    pub healthy_threshold: u32,
    /// Consecutive failures before a backend is marked down
    pub unhealthy_threshold: u32,
    /// Traffic protocol
    pub protocol: Protocol,
    /// Health check protocol
    pub health_check_protocol: Protocol,
    /// Path requested by HTTP health checks
    pub health_check_path: String,
    /// Session affinity policy
    pub sticky_sessions: StickySessions,
    /// Cookie name used when `sticky_sessions` is `Cookie`
    pub sticky_cookie_name: String,
}

impl Default for ConfigurationOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::RoundRobin,
            client_timeout: 30,
            server_timeout: 60,
            connection_limit: 1000,
            proxy_protocol: false,
            health_check_interval: 3,
            health_check_timeout: 5,
            healthy_threshold: 5,
            unhealthy_threshold: 3,
            protocol: Protocol::Tcp,
            health_check_protocol: Protocol::Tcp,
            health_check_path: "/".to_string(),
            sticky_sessions: StickySessions::None,
            sticky_cookie_name: "lb".to_string(),
        }
    }
}

/// Resolve annotations into validated options.
///
/// Unknown keys are ignored, including unknown keys under
/// [`ANNOTATION_PREFIX`].
pub fn resolve(raw: &BTreeMap<String, String>) -> Result<ConfigurationOptions> {
    let defaults = ConfigurationOptions::default();

    let protocol = enumerated(raw, ANNO_PROTOCOL, Protocol::parse, "tcp, http, https")?
        .unwrap_or(defaults.protocol);

    let options = ConfigurationOptions {
        algorithm: enumerated(
            raw,
            ANNO_ALGORITHM,
            Algorithm::parse,
            "leastconn, roundrobin, source",
        )?
        .unwrap_or(defaults.algorithm),
        client_timeout: bounded(raw, ANNO_CLIENT_TIMEOUT, 1, 86400)?
            .unwrap_or(defaults.client_timeout),
        server_timeout: bounded(raw, ANNO_SERVER_TIMEOUT, 1, 86400)?
            .unwrap_or(defaults.server_timeout),
        connection_limit: bounded(raw, ANNO_CONNECTION_LIMIT, 1, 20000)?
            .unwrap_or(defaults.connection_limit),
        proxy_protocol: boolean(raw, ANNO_PROXY_PROTOCOL)?.unwrap_or(defaults.proxy_protocol),
        health_check_interval: bounded(raw, ANNO_HEALTH_CHECK_INTERVAL, 3, 300)?
            .unwrap_or(defaults.health_check_interval),
        health_check_timeout: bounded(raw, ANNO_HEALTH_CHECK_TIMEOUT, 3, 300)?
            .unwrap_or(defaults.health_check_timeout),
        healthy_threshold: bounded(raw, ANNO_HEALTHY_THRESHOLD, 2, 10)?
            .unwrap_or(defaults.healthy_threshold),
        unhealthy_threshold: bounded(raw, ANNO_UNHEALTHY_THRESHOLD, 2, 10)?
            .unwrap_or(defaults.unhealthy_threshold),
        protocol,
        health_check_protocol: enumerated(
            raw,
            ANNO_HEALTH_CHECK_PROTOCOL,
            Protocol::parse,
            "tcp, http, https",
        )?
        .unwrap_or(protocol),
        health_check_path: health_check_path(raw)?.unwrap_or(defaults.health_check_path),
        sticky_sessions: enumerated(
            raw,
            ANNO_STICKY_SESSIONS,
            StickySessions::parse,
            "none, source-ip, cookie",
        )?
        .unwrap_or(defaults.sticky_sessions),
        sticky_cookie_name: cookie_name(raw)?.unwrap_or(defaults.sticky_cookie_name),
    };

    if options.sticky_sessions == StickySessions::Cookie && options.protocol != Protocol::Http {
        return Err(Error::invalid_option(
            ANNO_STICKY_SESSIONS,
            "cookie",
            format!(
                "cookie affinity requires protocol http, got {}",
                options.protocol
            ),
        ));
    }

    Ok(options)
}

/// Look up a key, treating an empty value as absent
fn lookup<'a>(raw: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    raw.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn bounded(raw: &BTreeMap<String, String>, key: &str, min: u32, max: u32) -> Result<Option<u32>> {
    let Some(value) = lookup(raw, key) else {
        return Ok(None);
    };
    let parsed: i64 = value
        .parse()
        .map_err(|_| Error::invalid_option(key, value, "not an integer"))?;
    if parsed < i64::from(min) || parsed > i64::from(max) {
        return Err(Error::invalid_option(
            key,
            value,
            format!("must be between {min} and {max}"),
        ));
    }
    Ok(Some(parsed as u32))
}

fn boolean(raw: &BTreeMap<String, String>, key: &str) -> Result<Option<bool>> {
    match lookup(raw, key) {
        None => Ok(None),
        Some("true") => Ok(Some(true)),
        Some("false") => Ok(Some(false)),
        Some(value) => Err(Error::invalid_option(key, value, "must be true or false")),
    }
}

fn enumerated<T>(
    raw: &BTreeMap<String, String>,
    key: &str,
    parse: fn(&str) -> Option<T>,
    allowed: &str,
) -> Result<Option<T>> {
    let Some(value) = lookup(raw, key) else {
        return Ok(None);
    };
    parse(value)
        .map(Some)
        .ok_or_else(|| Error::invalid_option(key, value, format!("must be one of: {allowed}")))
}

fn health_check_path(raw: &BTreeMap<String, String>) -> Result<Option<String>> {
    let Some(value) = lookup(raw, ANNO_HEALTH_CHECK_PATH) else {
        return Ok(None);
    };
    if !value.starts_with('/') {
        return Err(Error::invalid_option(
            ANNO_HEALTH_CHECK_PATH,
            value,
            "must start with '/'",
        ));
    }
    if !value.chars().all(is_path_char) {
        return Err(Error::invalid_option(
            ANNO_HEALTH_CHECK_PATH,
            value,
            "must be a URL path of [A-Za-z0-9-._~%!$&()*+,;=:@/?]",
        ));
    }
    Ok(Some(value.to_string()))
}

/// URI path and query characters that survive the config file unquoted.
/// `'` is a valid sub-delimiter but the config parser treats it as a quote.
fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-._~%!$&()*+,;=:@/?".contains(c)
}

fn cookie_name(raw: &BTreeMap<String, String>) -> Result<Option<String>> {
    let Some(value) = lookup(raw, ANNO_STICKY_COOKIE_NAME) else {
        return Ok(None);
    };
    let valid = value.len() <= 64
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(Error::invalid_option(
            ANNO_STICKY_COOKIE_NAME,
            value,
            "must be 1-64 characters of [A-Za-z0-9_-]",
        ));
    }
    Ok(Some(value.to_string()))
}
