use anyhow::Result;
use argh::FromArgs;
use serde::Deserialize;
use std::{collections::HashMap, fs, net::{IpAddr, Ipv6Addr}, path::PathBuf};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub smtp: Smtp,
    pub auth: Auth,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Smtp {
    pub address: IpAddr,
    pub port: u16,
    /// Domain to announce, defaults to the host name
    pub domain: Option<String>,
    pub max_message_size: Option<usize>,
}

impl Default for Smtp {
    fn default() -> Self {
        Smtp {
            address: Ipv6Addr::UNSPECIFIED.into(),
            port: 2525,
            domain: None,
            max_message_size: None,
        }
    }
}

/// Accounts accepted by AUTH; authentication is disabled when empty
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Auth {
    pub users: HashMap<String, String>,
}

/// SMTP server keeping received messages in memory
#[derive(FromArgs)]
struct Args {
    /// configuration file to use
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
    /// port to run SMTP server on
    #[argh(option)]
    port: Option<u16>,
    /// domain to announce to clients
    #[argh(option)]
    domain: Option<String>,
}

pub fn load() -> Result<Config> {
    let args: Args = argh::from_env();

    let mut config = match args.config {
        None => Config::default(),
        Some(path) => parse(&fs::read_to_string(path)?)?,
    };

    if let Some(port) = args.port {
        config.smtp.port = port;
    }

    if let Some(domain) = args.domain {
        config.smtp.domain = Some(domain);
    }

    Ok(config)
}

fn parse(data: &str) -> Result<Config> {
    Ok(toml::from_str(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.smtp.port, 2525);
        assert_eq!(config.smtp.address, IpAddr::from(Ipv6Addr::UNSPECIFIED));
        assert!(config.smtp.domain.is_none());
        assert!(config.auth.users.is_empty());
    }

    #[test]
    fn full_file() {
        let config = parse(r#"
            [smtp]
            address = "127.0.0.1"
            port = 25
            domain = "mx.example.org"
            max_message_size = 1048576

            [auth.users]
            alice = "wonderland"
        "#).unwrap();

        assert_eq!(config.smtp.address, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(config.smtp.port, 25);
        assert_eq!(config.smtp.domain.as_deref(), Some("mx.example.org"));
        assert_eq!(config.smtp.max_message_size, Some(1 << 20));
        assert_eq!(config.auth.users["alice"], "wonderland");
    }

    #[test]
    fn rejects_unknown_types() {
        assert!(parse("[smtp]\nport = \"twenty-five\"").is_err());
    }
}
