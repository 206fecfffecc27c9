use std::fs::read_to_string;

use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct Listen {
    /// server port
    ///
    /// the port the WebSocket acceptor binds on.
    #[serde(default = "Listen::port")]
    pub port: u16,

    /// maximum concurrent sessions
    ///
    /// connections beyond this limit are dropped before their handshake.
    /// Session ids are assigned from `1..=max_sessions`.
    #[serde(default = "Listen::max_sessions")]
    pub max_sessions: usize,
}

impl Listen {
    fn port() -> u16 {
        8080
    }

    fn max_sessions() -> usize {
        32
    }
}

impl Default for Listen {
    fn default() -> Self {
        Self {
            port: Self::port(),
            max_sessions: Self::max_sessions(),
        }
    }
}

/// TLS credentials for the secure variant.
///
/// with `certificate` and `authority` both present the server verifies
/// client certificates against the authority; otherwise it runs without
/// peer verification, backed by the bundled default certificate.
#[derive(Deserialize, Debug)]
pub struct Tls {
    /// private key file path (PEM).
    pub private_key: String,

    /// certificate chain file path (PEM).
    #[serde(default)]
    pub certificate: Option<String>,

    /// certificate authority file path (PEM) used to verify peers.
    #[serde(default)]
    pub authority: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub listen: Listen,

    /// TLS section; absent for a plain server.
    #[serde(default)]
    pub tls: Option<Tls>,

    #[serde(default)]
    pub log: Log,
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// specify the configuration file path.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Load command line parameters. When a configuration file path is
    /// given the configuration is read from it, otherwise the defaults
    /// are used.
    pub fn load() -> anyhow::Result<Self> {
        match Cli::parse().config {
            Some(path) => Ok(toml::from_str(&read_to_string(path)?)?),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.listen.port, 8080);
        assert_eq!(config.listen.max_sessions, 32);
        assert!(config.tls.is_none());
    }

    #[test]
    fn tls_section_is_parsed() {
        let config: Config = toml::from_str(
            r#"
            [listen]
            port = 8443

            [tls]
            private_key = "credentials/server-key.pem"
            certificate = "credentials/server-cert.pem"
            authority = "credentials/server-cert.pem"
            "#,
        )
        .unwrap();

        assert_eq!(config.listen.port, 8443);
        let tls = config.tls.unwrap();
        assert_eq!(tls.private_key, "credentials/server-key.pem");
        assert!(tls.certificate.is_some());
        assert!(tls.authority.is_some());
    }
}
