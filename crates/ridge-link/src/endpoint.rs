//! Endpoint grammar: `scheme/address[#k=v(&k=v)*]`.
//!
//! Examples: `tcp/10.0.0.1:7447`, `udp/224.0.0.224:7447#iface=eth0`,
//! `serial/dev/ttyUSB0#baudrate=115200`.

use crate::LinkError;

/// Every scheme the endpoint parser recognizes. Recognition is wider than
/// what [`crate::Link::open`] can actually dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
    Udp,
    Ws,
    Wss,
    Serial,
    Bt,
    RawEth,
}

impl Scheme {
    pub fn parse(s: &str) -> Result<Self, LinkError> {
        match s {
            "tcp" => Ok(Scheme::Tcp),
            "tls" => Ok(Scheme::Tls),
            "udp" => Ok(Scheme::Udp),
            "ws" => Ok(Scheme::Ws),
            "wss" => Ok(Scheme::Wss),
            "serial" => Ok(Scheme::Serial),
            "bt" => Ok(Scheme::Bt),
            "reth" => Ok(Scheme::RawEth),
            other => Err(LinkError::UnknownScheme(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Tls => "tls",
            Scheme::Udp => "udp",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
            Scheme::Serial => "serial",
            Scheme::Bt => "bt",
            Scheme::RawEth => "reth",
        }
    }
}

/// A parsed endpoint: scheme, address, and `#`-section options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub address: String,
    config: Vec<(String, String)>,
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self, LinkError> {
        let (scheme_str, rest) = s
            .split_once('/')
            .ok_or_else(|| LinkError::LocatorInvalid(s.to_string()))?;
        let scheme = Scheme::parse(scheme_str)?;
        let (address, config_str) = match rest.split_once('#') {
            Some((a, c)) => (a, Some(c)),
            None => (rest, None),
        };
        if address.is_empty() {
            return Err(LinkError::LocatorInvalid(s.to_string()));
        }
        let mut config = Vec::new();
        if let Some(config_str) = config_str {
            for pair in config_str.split('&') {
                let (k, v) = pair
                    .split_once('=')
                    .ok_or_else(|| LinkError::LocatorInvalid(s.to_string()))?;
                if k.is_empty() {
                    return Err(LinkError::LocatorInvalid(s.to_string()));
                }
                config.push((k.to_string(), v.to_string()));
            }
        }
        Ok(Self {
            scheme,
            address: address.to_string(),
            config,
        })
    }

    /// Look up a `#`-section option.
    pub fn config_get(&self, key: &str) -> Option<&str> {
        self.config
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Add or replace a `#`-section option.
    pub fn config_set(&mut self, key: &str, value: &str) {
        if let Some(entry) = self.config.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value.to_string();
        } else {
            self.config.push((key.to_string(), value.to_string()));
        }
    }

    /// Resolve the address part as a socket address.
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, LinkError> {
        self.address
            .parse()
            .map_err(|_| LinkError::LocatorInvalid(self.to_string()))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.scheme.as_str(), self.address)?;
        for (i, (k, v)) in self.config.iter().enumerate() {
            write!(f, "{}{k}={v}", if i == 0 { '#' } else { '&' })?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Endpoint {
    type Err = LinkError;
    fn from_str(s: &str) -> Result<Self, LinkError> {
        Endpoint::parse(s)
    }
}
