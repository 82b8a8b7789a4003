//! Where the in-editor bridge dials back to.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Environment variable carrying the JSON-encoded [`ListenerAddress`] to the runner.
pub const ADDRESS_ENV: &str = "PLUGTEST_ADDRESS";

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("Environment variable '{0}' is not set")]
    Missing(&'static str),
    #[error("malformed listener address: {0}")]
    Json(#[from] serde_json::Error),
    #[error("listener address has an invalid hostname '{0}'")]
    Hostname(String),
}

/// A bound listener, as serialized into the child's environment.
///
/// ```json
/// {"transport":"tcp","hostname":"127.0.0.1","port":41234}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerAddress {
    pub transport: String,
    pub hostname: String,
    pub port: u16,
}

impl ListenerAddress {
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            transport: "tcp".into(),
            hostname: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, AddressError> {
        let ip: IpAddr = self
            .hostname
            .parse()
            .map_err(|_| AddressError::Hostname(self.hostname.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn to_json(&self) -> String {
        // three plain fields; serde_json cannot fail here
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self, AddressError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read from [`ADDRESS_ENV`].
    pub fn from_env() -> Result<Self, AddressError> {
        let json = std::env::var(ADDRESS_ENV).map_err(|_| AddressError::Missing(ADDRESS_ENV))?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_shape() {
        let addr = ListenerAddress::tcp("127.0.0.1:41234".parse().unwrap());
        assert_eq!(
            addr.to_json(),
            r#"{"transport":"tcp","hostname":"127.0.0.1","port":41234}"#
        );
        let back = ListenerAddress::from_json(&addr.to_json()).unwrap();
        assert_eq!(back.socket_addr().unwrap().port(), 41234);
    }

    #[test]
    fn rejects_hostnames_that_are_not_ips() {
        let addr = ListenerAddress {
            transport: "tcp".into(),
            hostname: "localhost".into(),
            port: 1,
        };
        assert!(matches!(addr.socket_addr(), Err(AddressError::Hostname(_))));
    }
}
