//! Flat name/value configuration from the embedder.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use zeroize::Zeroizing;

use crate::resolver::QueryType;

/// Which resolver backend to wire up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DnsResolverChoice {
    #[default]
    HostNative,
    GooglePublicDns,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Host name or literal address.
    pub addr: String,
    /// TCP/UDP port, kept as text for argv handoff.
    pub port: String,
    pub family: QueryType,
    pub ssh_mode: bool,
    /// Direct-mode pre-shared secret, exported as `MOSH_KEY`.
    pub key: Zeroizing<String>,
    pub user: String,
    pub remote_command: String,
    pub server_command: String,
    pub use_agent: bool,
    pub mosh_escape_key: String,
    pub dns_resolver: DnsResolverChoice,
    pub trust_sshfp: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            addr: String::new(),
            port: String::new(),
            family: QueryType::A,
            ssh_mode: false,
            key: Zeroizing::new(String::new()),
            user: String::new(),
            remote_command: String::new(),
            server_command: String::new(),
            use_agent: false,
            mosh_escape_key: String::new(),
            dns_resolver: DnsResolverChoice::default(),
            trust_sshfp: false,
        }
    }
}

impl Config {
    /// Parses embedder attributes. Unrecognized names are ignored so old
    /// embedders keep working; malformed values of recognized names fail.
    pub fn parse<'a, I>(attrs: I) -> Result<Config>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Config::default();
        for (name, value) in attrs {
            match name {
                "addr" => config.addr = value.into(),
                "port" => config.port = value.into(),
                "family" => match value {
                    "IPv4" => config.family = QueryType::A,
                    "IPv6" => config.family = QueryType::Aaaa,
                    other => debug!("ignoring unknown family {other:?}"),
                },
                "mode" => config.ssh_mode = value == "ssh",
                "key" => config.key = Zeroizing::new(value.into()),
                "user" => config.user = value.into(),
                "remote-command" => config.remote_command = value.into(),
                "server-command" => config.server_command = value.into(),
                "use-agent" => config.use_agent = value == "true",
                "mosh-escape-key" => config.mosh_escape_key = value.into(),
                "dns-resolver" => match value {
                    "google-public-dns" => {
                        config.dns_resolver = DnsResolverChoice::GooglePublicDns
                    }
                    other => {
                        warn!("unknown resolver {other:?}");
                        return Err(Error::BadConfig { msg: "unknown dns-resolver" });
                    }
                },
                "trust-sshfp" => config.trust_sshfp = value == "true",
                other => debug!("ignoring unknown attribute {other:?}"),
            }
        }

        if config.addr.is_empty() || config.port.is_empty() {
            return Err(Error::BadConfig { msg: "addr and port are required" });
        }
        if config.ssh_mode && config.user.is_empty() {
            return Err(Error::BadConfig { msg: "ssh mode requires a user" });
        }
        Ok(config)
    }
}
