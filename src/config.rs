use std::fs;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::balancer::{Balancer, FixedPoolBalancer, InterfaceBalancer};
use crate::establish::DEFAULT_CONNECT_TIMEOUT;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(#[from] io::Error),
    #[error("parse config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("interface pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("no listener configured")]
    NoListener,
    #[error("egress pools are both empty")]
    EmptyPool,
}

#[derive(Debug, Deserialize)]
pub struct Listen {
    pub socks5: Option<String>,
    pub http: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Egress {
    Fixed {
        #[serde(default)]
        v4: Vec<Ipv4Addr>,
        #[serde(default)]
        v6: Vec<Ipv6Addr>,
        #[serde(default)]
        prefer_v6: bool,
    },
    Interfaces {
        pattern: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub listen: Listen,
    pub egress: Egress,
    connect_timeout_ms: Option<u64>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        content.parse()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn balancer(&self) -> Result<Arc<dyn Balancer>, ConfigError> {
        let balancer: Arc<dyn Balancer> = match &self.egress {
            Egress::Fixed { v4, v6, prefer_v6 } => {
                Arc::new(FixedPoolBalancer::new(v4.clone(), v6.clone(), *prefer_v6))
            }
            Egress::Interfaces { pattern } => {
                Arc::new(InterfaceBalancer::new(Regex::new(pattern)?))
            }
        };
        Ok(balancer)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.socks5.is_none() && self.listen.http.is_none() {
            return Err(ConfigError::NoListener);
        }

        match &self.egress {
            Egress::Fixed { v4, v6, .. } if v4.is_empty() && v6.is_empty() => {
                Err(ConfigError::EmptyPool)
            }
            Egress::Fixed { .. } => Ok(()),
            Egress::Interfaces { pattern } => Regex::new(pattern).map(|_| ()).map_err(Into::into),
        }
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_pool() {
        let config: Config = r#"
            connect_timeout_ms = 2500

            [listen]
            socks5 = "127.0.0.1:1080"
            http = "127.0.0.1:8080"

            [egress]
            type = "Fixed"
            v4 = ["203.0.113.10", "203.0.113.11"]
            v6 = ["2001:db8::10"]
            prefer_v6 = true
        "#
        .parse()
        .unwrap();

        assert_eq!(config.listen.socks5.as_deref(), Some("127.0.0.1:1080"));
        assert_eq!(config.connect_timeout(), Duration::from_millis(2500));
        match &config.egress {
            Egress::Fixed { v4, v6, prefer_v6 } => {
                assert_eq!(v4.len(), 2);
                assert_eq!(v6, &vec!["2001:db8::10".parse::<Ipv6Addr>().unwrap()]);
                assert!(*prefer_v6);
            }
            Egress::Interfaces { .. } => panic!("expected fixed pool"),
        }

        let balancer = config.balancer().unwrap();
        assert!(balancer.next(true, true).unwrap().is_ipv6());
    }

    #[test]
    fn interfaces() {
        let config: Config = r#"
            [listen]
            socks5 = "127.0.0.1:1080"

            [egress]
            type = "Interfaces"
            pattern = "^(eth|ens)"
        "#
        .parse()
        .unwrap();

        assert_eq!(config.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
        assert!(config.balancer().is_ok());
    }

    #[test]
    fn wrong_family_is_rejected() {
        let result: Result<Config, _> = r#"
            [listen]
            socks5 = "127.0.0.1:1080"

            [egress]
            type = "Fixed"
            v4 = ["2001:db8::10"]
        "#
        .parse();

        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn invalid_configs() {
        let no_listener: Result<Config, _> = r#"
            [listen]

            [egress]
            type = "Fixed"
            v4 = ["203.0.113.10"]
        "#
        .parse();
        assert!(matches!(no_listener, Err(ConfigError::NoListener)));

        let empty: Result<Config, _> = r#"
            [listen]
            http = "127.0.0.1:8080"

            [egress]
            type = "Fixed"
        "#
        .parse();
        assert!(matches!(empty, Err(ConfigError::EmptyPool)));

        let bad_pattern: Result<Config, _> = r#"
            [listen]
            http = "127.0.0.1:8080"

            [egress]
            type = "Interfaces"
            pattern = "("
        "#
        .parse();
        assert!(matches!(bad_pattern, Err(ConfigError::Pattern(_))));
    }
}
