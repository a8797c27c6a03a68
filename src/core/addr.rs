// Multiaddr-form API address parsing and conversion to dial arguments.
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::core::error::{Error, ErrorKind};

/// An API endpoint in multiaddr form, e.g. `/ip4/127.0.0.1/tcp/5201`.
///
/// Only the subset the daemon API needs is supported: an `ip4`, `ip6`,
/// `dns`, `dns4`, or `dns6` host component followed by a `tcp` port.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApiAddr {
    host: Host,
    port: u16,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Host {
    Ip(IpAddr),
    Name(String),
}

impl ApiAddr {
    pub fn parse(addr: &str) -> Result<Self, Error> {
        let mut parts = addr.strip_prefix('/').map(|rest| rest.split('/'));
        let Some(parts) = parts.as_mut() else {
            return Err(invalid(addr, "address must start with '/'"));
        };

        let proto = parts.next().unwrap_or_default();
        let host_part = parts
            .next()
            .ok_or_else(|| invalid(addr, "missing host component"))?;
        let host = match proto {
            "ip4" | "ip6" => {
                let ip: IpAddr = host_part
                    .parse()
                    .map_err(|_| invalid(addr, "invalid ip address"))?;
                if (proto == "ip4") != ip.is_ipv4() {
                    return Err(invalid(addr, "ip version does not match protocol"));
                }
                Host::Ip(ip)
            }
            "dns" | "dns4" | "dns6" => {
                if host_part.is_empty() {
                    return Err(invalid(addr, "empty host name"));
                }
                Host::Name(host_part.to_string())
            }
            _ => return Err(invalid(addr, "unsupported host protocol")),
        };

        match parts.next() {
            Some("tcp") => {}
            _ => return Err(invalid(addr, "expected '/tcp/<port>' transport")),
        }
        let port = parts
            .next()
            .and_then(|value| value.parse::<u16>().ok())
            .ok_or_else(|| invalid(addr, "invalid tcp port"))?;
        if parts.next().is_some() {
            return Err(invalid(addr, "trailing address components"));
        }

        Ok(Self { host, port })
    }

    /// Dial arguments in `host:port` form, suitable for an HTTP client.
    pub fn dial_addr(&self) -> String {
        match &self.host {
            Host::Ip(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.port),
            Host::Ip(IpAddr::V4(ip)) => format!("{ip}:{}", self.port),
            Host::Name(name) => format!("{name}:{}", self.port),
        }
    }

    /// Concrete socket address for binding a listener. Name hosts cannot be
    /// bound and are rejected.
    pub fn socket_addr(&self) -> Result<SocketAddr, Error> {
        match &self.host {
            Host::Ip(ip) => Ok(SocketAddr::new(*ip, self.port)),
            Host::Name(_) => Err(Error::new(ErrorKind::Usage)
                .with_message("api address must use an ip host to bind a listener")
                .with_hint("Use an /ip4/ or /ip6/ address in config.json for the daemon.")),
        }
    }
}

impl fmt::Display for ApiAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ip(IpAddr::V4(ip)) => write!(f, "/ip4/{ip}/tcp/{}", self.port),
            Host::Ip(IpAddr::V6(ip)) => write!(f, "/ip6/{ip}/tcp/{}", self.port),
            Host::Name(name) => write!(f, "/dns/{name}/tcp/{}", self.port),
        }
    }
}

fn invalid(addr: &str, detail: &str) -> Error {
    Error::new(ErrorKind::Config).with_message(format!("invalid api address '{addr}': {detail}"))
}
