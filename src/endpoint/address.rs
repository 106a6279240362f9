//! Endpoint address parsing.
//!
//! Addresses look like `scheme://host:port/path`. The scheme may be omitted
//! (the selecting factory's default is assumed), ports default per scheme,
//! and a missing host means "all interfaces" — valid for servers only.

use super::error::{EndpointError, EndpointResult};

/// A parsed endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddress {
    /// URL scheme, lower-cased.
    pub scheme: String,
    /// Host part, possibly empty.
    host: String,
    /// Explicit port, if any.
    port: Option<u16>,
    /// Path part, possibly empty.
    path: String,
}

impl EndpointAddress {
    /// Parse an address string, assuming `default_scheme` when none is given.
    ///
    /// A bare word without any of `:` `/` `.` is itself taken as a scheme
    /// (so `mqtt` means "mqtt on all interfaces, default port").
    ///
    /// # Errors
    ///
    /// Returns an error when the port is not numeric or brackets are
    /// unbalanced.
    pub fn parse(address: &str, default_scheme: &str) -> EndpointResult<Self> {
        let owned;
        let address = if address.contains("://") {
            address
        } else if !address.contains([':', '/', '.']) {
            owned = format!("{address}://");
            &owned
        } else {
            owned = format!("{default_scheme}://{address}");
            &owned
        };

        let (scheme, rest) = address
            .split_once("://")
            .ok_or_else(|| invalid(address, "missing scheme separator"))?;

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], rest[i..].to_string()),
            None => (rest, String::new()),
        };

        let (host, port) = parse_authority(authority).map_err(|msg| invalid(address, msg))?;

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            host,
            port,
            path,
        })
    }

    /// Host name, `0.0.0.0` when absent.
    #[must_use]
    pub fn hostname(&self) -> &str {
        if self.host.is_empty() {
            "0.0.0.0"
        } else {
            &self.host
        }
    }

    /// Port, falling back to the scheme default.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port.or_else(|| default_port(&self.scheme))
    }

    /// `host:port` suitable for binding or dialing.
    ///
    /// # Errors
    ///
    /// Returns an error when neither an explicit nor a default port exists.
    pub fn socket_addr(&self) -> EndpointResult<String> {
        let port = self.port().ok_or_else(|| {
            invalid(
                &self.to_string(),
                "no port given and no default for this scheme",
            )
        })?;
        Ok(format!("{}:{}", self.hostname(), port))
    }

    /// Path with a guaranteed trailing slash, for WS path comparison.
    #[must_use]
    pub fn dir_path(&self) -> String {
        if self.path.ends_with('/') {
            self.path.clone()
        } else {
            format!("{}/", self.path)
        }
    }

    /// Raw path as configured.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the path is empty or the bare root, required by `mqtt(s)`.
    #[must_use]
    pub fn has_plain_path(&self) -> bool {
        self.path.is_empty() || self.path == "/"
    }
}

impl std::fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.hostname())?;
        if let Some(port) = self.port() {
            write!(f, ":{port}")?;
        }
        write!(f, "{}", self.path)
    }
}

/// Split `host[:port]`, handling bracketed IPv6 literals.
fn parse_authority(authority: &str) -> Result<(String, Option<u16>), &'static str> {
    if authority.is_empty() {
        return Ok((String::new(), None));
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or("unbalanced IPv6 bracket")?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse().map_err(|_| "invalid port")?),
            None if tail.is_empty() => None,
            None => return Err("unexpected characters after IPv6 host"),
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| "invalid port")?;
            Ok((host.to_string(), Some(port)))
        }
        None => Ok((authority.to_string(), None)),
    }
}

/// Well-known default ports by scheme.
#[must_use]
pub fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        "mqtt" => Some(1883),
        "mqtts" => Some(8883),
        _ => None,
    }
}

fn invalid(address: &str, message: &str) -> EndpointError {
    EndpointError::InvalidAddress {
        address: address.to_string(),
        message: message.to_string(),
    }
}
