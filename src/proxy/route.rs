//! CIDR routing of clients to backends and backend groups.

use super::backend::Backend;
use super::error::{ProxyError, ProxyResult};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// Names of the groups materialised from backend schemes when absent.
const SYNTHETIC_GROUPS: [&str; 7] = ["all", "ws", "wss", "ws-*", "mqtt", "mqtts", "mqtt-*"];

/// Whether a group name is one of the synthetic per-scheme groups.
#[must_use]
pub fn is_synthetic_group(name: &str) -> bool {
    SYNTHETIC_GROUPS.contains(&name)
}

/// An IPv4 or IPv6 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CidrNet {
    /// IPv4 network.
    V4 {
        /// Network bits after masking.
        network: u32,
        /// Prefix mask.
        mask: u32,
    },
    /// IPv6 network.
    V6 {
        /// Network bits after masking.
        network: u128,
        /// Prefix mask.
        mask: u128,
    },
}

impl CidrNet {
    /// Parse `a.b.c.d/len`, `addr6/len`, or a bare address (host route).
    ///
    /// # Errors
    ///
    /// Returns an error for unparseable addresses or out-of-range prefix
    /// lengths.
    pub fn parse(cidr: &str) -> ProxyResult<Self> {
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, len)) => {
                let prefix: u8 = len.parse().map_err(|_| invalid(cidr, "bad prefix length"))?;
                (addr, Some(prefix))
            }
            None => (cidr, None),
        };

        if let Ok(v4) = addr.parse::<Ipv4Addr>() {
            let prefix = prefix.unwrap_or(32);
            if prefix > 32 {
                return Err(invalid(cidr, "prefix length must be 0-32"));
            }
            let mask = v4_mask(prefix);
            return Ok(Self::V4 {
                network: u32::from(v4) & mask,
                mask,
            });
        }
        if let Ok(v6) = addr.parse::<Ipv6Addr>() {
            let prefix = prefix.unwrap_or(128);
            if prefix > 128 {
                return Err(invalid(cidr, "prefix length must be 0-128"));
            }
            let mask = v6_mask(prefix);
            return Ok(Self::V6 {
                network: u128::from(v6) & mask,
                mask,
            });
        }
        Err(invalid(cidr, "not an IP network"))
    }

    /// Whether the address falls inside this network. IPv4-mapped IPv6
    /// addresses match IPv4 networks.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (Self::V4 { network, mask }, IpAddr::V4(v4)) => u32::from(v4) & mask == *network,
            (Self::V4 { network, mask }, IpAddr::V6(v6)) => v6
                .to_ipv4_mapped()
                .is_some_and(|v4| u32::from(v4) & mask == *network),
            (Self::V6 { network, mask }, IpAddr::V6(v6)) => u128::from(v6) & mask == *network,
            (Self::V6 { .. }, IpAddr::V4(_)) => false,
        }
    }
}

fn v4_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        !0u32 << (32 - u32::from(prefix))
    }
}

fn v6_mask(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        !0u128 << (128 - u32::from(prefix))
    }
}

fn invalid(cidr: &str, message: &str) -> ProxyError {
    ProxyError::InvalidCidr {
        cidr: cidr.to_string(),
        message: message.to_string(),
    }
}

/// What a matched rule sends the client to.
#[derive(Debug, Clone)]
pub enum RouteTarget {
    /// A single backend.
    Backend(Arc<Backend>),
    /// A weighted group, resolved through the selector.
    Group(Vec<Arc<Backend>>),
}

impl RouteTarget {
    /// The selection candidates behind this target.
    #[must_use]
    pub fn candidates(&self) -> &[Arc<Backend>] {
        match self {
            Self::Backend(backend) => std::slice::from_ref(backend),
            Self::Group(group) => group,
        }
    }
}

/// One ordered rule.
#[derive(Debug, Clone)]
pub struct RouteRule {
    /// Client source network.
    pub network: CidrNet,
    /// Where matching clients go.
    pub target: RouteTarget,
}

/// An ordered rule table with an optional fallback.
#[derive(Debug, Clone, Default)]
pub struct Route {
    rules: Vec<RouteRule>,
    default_target: Option<RouteTarget>,
}

impl Route {
    /// Build a route from ordered rules and an optional default target.
    #[must_use]
    pub fn new(rules: Vec<RouteRule>, default_target: Option<RouteTarget>) -> Self {
        Self {
            rules,
            default_target,
        }
    }

    /// Resolve a client address; first matching rule wins, then the default.
    #[must_use]
    pub fn resolve(&self, ip: IpAddr) -> Option<&RouteTarget> {
        self.rules
            .iter()
            .find(|rule| rule.network.contains(ip))
            .map(|rule| &rule.target)
            .or(self.default_target.as_ref())
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the table has neither rules nor a default.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.default_target.is_none()
    }
}

/// Materialise the synthetic per-scheme groups next to the explicit ones.
/// An explicit group keeps its name; synthetic ones fill the gaps:
/// `all`, `ws`, `wss`, `ws-*` (ws ∪ wss), `mqtt`, `mqtts`,
/// `mqtt-*` (mqtt ∪ mqtts).
#[must_use]
pub fn with_synthetic_groups(
    backends: &[Arc<Backend>],
    mut groups: BTreeMap<String, Vec<Arc<Backend>>>,
) -> BTreeMap<String, Vec<Arc<Backend>>> {
    let mut add = |name: &str, predicate: &dyn Fn(&str) -> bool| {
        if groups.contains_key(name) {
            return;
        }
        let members: Vec<Arc<Backend>> = backends
            .iter()
            .filter(|b| predicate(b.endpoint().scheme()))
            .cloned()
            .collect();
        groups.insert(name.to_string(), members);
    };

    add("all", &|_| true);
    add("ws", &|scheme| scheme == "ws");
    add("wss", &|scheme| scheme == "wss");
    add("ws-*", &|scheme| scheme == "ws" || scheme == "wss");
    add("mqtt", &|scheme| scheme == "mqtt");
    add("mqtts", &|scheme| scheme == "mqtts");
    add("mqtt-*", &|scheme| scheme == "mqtt" || scheme == "mqtts");

    groups
}
