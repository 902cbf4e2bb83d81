//! Process Configuration
//!
//! Every listener and the reset engine take an explicit config value. This
//! module builds all of them once from environment variables.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::network::{DnsConfig, GatewayConfig, HostOverride};
use crate::rpc::RpcServerConfig;
use crate::session::calendar::DEFAULT_UTC_OFFSET_SECS;
use crate::session::{IdolType, ResetConfig, ServerClock, Song, SpecialDate, UserId};

/// Song catalog used when `SONG_CATALOG` is unset, as `(song, idol type)`.
const DEFAULT_CATALOG: [(u32, u8); 6] = [(1, 1), (2, 2), (3, 3), (4, 1), (5, 2), (6, 3)];

/// Daily song mission seeded when `RESET_DAILY_SONG_MISSION` is unset.
const DEFAULT_DAILY_SONG_MISSION: u32 = 1;

/// Configuration errors. Each names the offending variable.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Variable present but unusable.
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Complete process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// DNS redirector.
    pub dns: DnsConfig,
    /// TLS gateway.
    pub gateway: GatewayConfig,
    /// Internal RPC server.
    pub rpc: RpcServerConfig,
    /// Daily reset tuning.
    pub reset: ResetConfig,
    /// Server timezone.
    pub clock: ServerClock,
    /// Song catalog loaded into the in-memory store.
    pub catalog: Vec<Song>,
    /// User created in the in-memory store at startup.
    pub seed_user: UserId,
}

impl Default for AppConfig {
    fn default() -> Self {
        let rpc = RpcServerConfig::default();
        Self {
            dns: DnsConfig::default(),
            gateway: GatewayConfig {
                backend_addr: rpc.bind_addr,
                ..GatewayConfig::default()
            },
            rpc,
            reset: ResetConfig {
                daily_song_mission: Some(DEFAULT_DAILY_SONG_MISSION),
                ..ResetConfig::default()
            },
            clock: ServerClock::default(),
            catalog: DEFAULT_CATALOG
                .iter()
                .map(|&(song_id, idol)| Song { song_id, idol_type: IdolType(idol) })
                .collect(),
            seed_user: UserId(1),
        }
    }
}

impl AppConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Create config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let mut config = Self::default();

        // DNS
        if let Some(addr) = env.parse::<SocketAddr>("DNS_BIND_ADDR")? {
            config.dns.bind_addr = addr;
        }
        if let Some(addr) = env.parse::<SocketAddr>("DNS_UPSTREAM")? {
            config.dns.upstream = addr;
        }
        if let Some(secs) = env.parse::<u64>("DNS_TTL_SECS")? {
            config.dns.ttl = Duration::from_secs(secs);
        }
        let ipv4 = env.parse::<Ipv4Addr>("DNS_LOCAL_IPV4")?.unwrap_or(Ipv4Addr::LOCALHOST);
        let ipv6 = env.parse::<Ipv6Addr>("DNS_LOCAL_IPV6")?;
        if let Some(hosts) = env.get("DNS_INTERCEPT_HOSTS") {
            config.dns.overrides = split_list(&hosts)
                .map(|host| {
                    let host = HostOverride::new(host, ipv4);
                    match ipv6 {
                        Some(ip) => host.with_ipv6(ip),
                        None => host,
                    }
                })
                .collect();
        }

        // RPC server (before the gateway, which defaults to it)
        if let Some(addr) = env.parse::<SocketAddr>("RPC_BIND_ADDR")? {
            config.rpc.bind_addr = addr;
            config.gateway.backend_addr = addr;
        }

        // Gateway
        if let Some(addr) = env.parse::<SocketAddr>("GATEWAY_BIND_ADDR")? {
            config.gateway.bind_addr = addr;
        }
        if let Some(addr) = env.parse::<SocketAddr>("GATEWAY_BACKEND_ADDR")? {
            config.gateway.backend_addr = addr;
        }
        if let Some(path) = env.get("GATEWAY_CERT_PATH") {
            config.gateway.cert_path = PathBuf::from(path);
        }
        if let Some(path) = env.get("GATEWAY_KEY_PATH") {
            config.gateway.key_path = PathBuf::from(path);
        }
        if let Some(secs) = env.parse::<u64>("GATEWAY_BACKEND_TIMEOUT_SECS")? {
            config.gateway.backend_timeout = Duration::from_secs(secs);
        }

        // Session
        let offset = env.parse::<i32>("SERVER_UTC_OFFSET_SECS")?.unwrap_or(DEFAULT_UTC_OFFSET_SECS);
        config.clock = ServerClock::from_offset_secs(offset)
            .ok_or_else(|| invalid("SERVER_UTC_OFFSET_SECS", &offset.to_string(), "offset out of range"))?;

        if let Some(items) = env.get("RESET_ONE_DAY_ITEMS") {
            config.reset.one_day_items = split_list(&items)
                .map(|item| parse_value("RESET_ONE_DAY_ITEMS", item))
                .collect::<Result<_, _>>()?;
        }
        if let Some(mission) = env.parse("RESET_DAILY_SONG_MISSION")? {
            config.reset.daily_song_mission = Some(mission);
        }
        if let Some(dates) = env.get("RESET_SPECIAL_DATES") {
            config.reset.special_dates = split_list(&dates)
                .map(parse_special_date)
                .collect::<Result<_, _>>()?;
        }

        if let Some(catalog) = env.get("SONG_CATALOG") {
            config.catalog = split_list(&catalog)
                .map(parse_song)
                .collect::<Result<_, _>>()?;
        }

        if let Some(user) = env.parse::<u64>("DEFAULT_USER_ID")? {
            config.seed_user = UserId(user);
        }

        Ok(config)
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(var).map(|raw| parse_value(var, &raw)).transpose()
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_value<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| invalid(var, raw, e.to_string()))
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// `MM-DD=song`
fn parse_special_date(entry: &str) -> Result<SpecialDate, ConfigError> {
    const VAR: &str = "RESET_SPECIAL_DATES";

    let (date, song) = entry
        .split_once('=')
        .ok_or_else(|| invalid(VAR, entry, "expected MM-DD=song"))?;
    let (month, day) = date
        .split_once('-')
        .ok_or_else(|| invalid(VAR, entry, "expected MM-DD=song"))?;

    let special = SpecialDate {
        month: parse_value(VAR, month)?,
        day: parse_value(VAR, day)?,
        song_id: parse_value(VAR, song)?,
    };
    if !(1..=12).contains(&special.month) || !(1..=31).contains(&special.day) {
        return Err(invalid(VAR, entry, "month or day out of range"));
    }
    Ok(special)
}

/// `song:idol_type`
fn parse_song(entry: &str) -> Result<Song, ConfigError> {
    const VAR: &str = "SONG_CATALOG";

    let (song, idol) = entry
        .split_once(':')
        .ok_or_else(|| invalid(VAR, entry, "expected song:idol_type"))?;
    Ok(Song {
        song_id: parse_value(VAR, song)?,
        idol_type: IdolType(parse_value(VAR, idol)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: BTreeMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.dns.ttl, Duration::from_secs(60));
        assert_eq!(config.gateway.backend_addr, config.rpc.bind_addr);
        assert_eq!(config.clock.offset().local_minus_utc(), 9 * 3600);
        assert!(config.dns.overrides.is_empty());
        assert_eq!(config.seed_user, UserId(1));
        assert_eq!(config.catalog.len(), 6);
        assert_eq!(config.reset.daily_song_mission, Some(1));
    }

    #[test]
    fn test_full_environment() {
        let config = from_pairs(&[
            ("DNS_BIND_ADDR", "0.0.0.0:5353"),
            ("DNS_UPSTREAM", "1.1.1.1:53"),
            ("DNS_INTERCEPT_HOSTS", "api.game.example, assets.game.example ,"),
            ("DNS_LOCAL_IPV4", "192.168.1.20"),
            ("DNS_LOCAL_IPV6", "fd00::20"),
            ("DNS_TTL_SECS", "30"),
            ("RPC_BIND_ADDR", "127.0.0.1:9000"),
            ("GATEWAY_BIND_ADDR", "0.0.0.0:8443"),
            ("GATEWAY_CERT_PATH", "/tmp/c.pem"),
            ("GATEWAY_KEY_PATH", "/tmp/k.pem"),
            ("GATEWAY_BACKEND_TIMEOUT_SECS", "12"),
            ("SERVER_UTC_OFFSET_SECS", "0"),
            ("RESET_ONE_DAY_ITEMS", "500,501"),
            ("RESET_DAILY_SONG_MISSION", "10"),
            ("RESET_SPECIAL_DATES", "07-14=3, 12-25=9"),
            ("SONG_CATALOG", "10:1, 11:3"),
            ("DEFAULT_USER_ID", "1001"),
        ])
        .unwrap();

        assert_eq!(config.dns.upstream, "1.1.1.1:53".parse().unwrap());
        assert_eq!(config.dns.overrides.len(), 2);
        assert_eq!(config.dns.overrides[1].host, "assets.game.example");
        assert_eq!(config.dns.overrides[0].ipv6, Some("fd00::20".parse().unwrap()));
        assert_eq!(config.gateway.backend_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.gateway.backend_timeout, Duration::from_secs(12));
        assert_eq!(config.clock, ServerClock::utc());
        assert_eq!(config.reset.one_day_items, vec![500, 501]);
        assert_eq!(config.reset.daily_song_mission, Some(10));
        assert_eq!(
            config.reset.special_dates,
            vec![
                SpecialDate { month: 7, day: 14, song_id: 3 },
                SpecialDate { month: 12, day: 25, song_id: 9 },
            ]
        );
        assert_eq!(
            config.catalog,
            vec![
                Song { song_id: 10, idol_type: IdolType(1) },
                Song { song_id: 11, idol_type: IdolType(3) },
            ]
        );
        assert_eq!(config.seed_user, UserId(1001));
    }

    #[test]
    fn test_error_names_variable() {
        let err = from_pairs(&[("DNS_TTL_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().starts_with("DNS_TTL_SECS="));

        let err = from_pairs(&[("RESET_SPECIAL_DATES", "13-01=2")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "RESET_SPECIAL_DATES", .. }));

        let err = from_pairs(&[("SONG_CATALOG", "10")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "SONG_CATALOG", .. }));

        let err = from_pairs(&[("SERVER_UTC_OFFSET_SECS", "999999")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "SERVER_UTC_OFFSET_SECS", .. }));
    }
}
