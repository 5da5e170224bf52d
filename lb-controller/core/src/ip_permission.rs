use crate::{diff::EqualityPolicy, labels::Labels, reconcile::Labeled};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The IP protocol a rule applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    /// Every protocol (`-1` on the wire).
    All,
    Other(u8),
}

/// An inclusive port range. ICMP rules carry the type and code here, with
/// `-1` as the wildcard.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRange {
    pub from: i32,
    pub to: i32,
}

/// The source (ingress) or destination (egress) of a rule.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Peer {
    Cidr(IpNet),
    SecurityGroup {
        group_id: String,
        user_id: Option<String>,
    },
    PrefixList(String),
}

/// A single rule attached to a security group.
///
/// Each value names exactly one peer; rules covering several peers are built
/// with [`IpPermission::expand`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpPermission {
    pub protocol: Protocol,

    /// `None` means every port.
    pub ports: Option<PortRange>,

    pub peer: Peer,

    pub description: Option<String>,

    /// Ownership bookkeeping. Never sent to the provider and never part of
    /// rule identity.
    #[serde(default)]
    pub labels: Labels,
}

/// Compares rules by protocol, ports, peer and description, ignoring labels.
#[derive(Copy, Clone, Debug, Default)]
pub struct IpPermissionEquality;

#[derive(Debug, thiserror::Error)]
#[error("invalid protocol {0:?}")]
pub struct InvalidProtocol(String);

// === impl Protocol ===

impl Protocol {
    pub fn number(&self) -> Option<u8> {
        match self {
            Self::Tcp => Some(6),
            Self::Udp => Some(17),
            Self::Icmp => Some(1),
            Self::Icmpv6 => Some(58),
            Self::All => None,
            Self::Other(n) => Some(*n),
        }
    }

    /// Whether the protocol carries ports (or ICMP type/code).
    pub fn has_ports(&self) -> bool {
        !matches!(self, Self::All)
    }
}

impl FromStr for Protocol {
    type Err = InvalidProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" | "6" => Ok(Self::Tcp),
            "udp" | "17" => Ok(Self::Udp),
            "icmp" | "1" => Ok(Self::Icmp),
            "icmpv6" | "58" => Ok(Self::Icmpv6),
            "-1" | "all" => Ok(Self::All),
            other => other
                .parse::<u8>()
                .map(Self::Other)
                .map_err(|_| InvalidProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
            Self::Icmp => f.write_str("icmp"),
            Self::Icmpv6 => f.write_str("icmpv6"),
            Self::All => f.write_str("-1"),
            Self::Other(n) => write!(f, "{n}"),
        }
    }
}

impl Serialize for Protocol {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// === impl PortRange ===

impl PortRange {
    pub const fn new(from: i32, to: i32) -> Self {
        Self { from, to }
    }

    pub const fn single(port: u16) -> Self {
        Self::new(port as i32, port as i32)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{}-{}", self.from, self.to)
        }
    }
}

// === impl Peer ===

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cidr(net) => fmt::Display::fmt(net, f),
            Self::SecurityGroup {
                group_id,
                user_id: Some(user),
            } => write!(f, "{user}/{group_id}"),
            Self::SecurityGroup { group_id, .. } => f.write_str(group_id),
            Self::PrefixList(id) => f.write_str(id),
        }
    }
}

// === impl IpPermission ===

impl IpPermission {
    pub fn new(protocol: Protocol, ports: Option<PortRange>, peer: Peer) -> Self {
        Self {
            protocol,
            ports,
            peer,
            description: None,
            labels: Labels::default(),
        }
    }

    pub fn cidr(protocol: Protocol, ports: Option<PortRange>, net: IpNet) -> Self {
        Self::new(protocol, ports, Peer::Cidr(net))
    }

    pub fn security_group(
        protocol: Protocol,
        ports: Option<PortRange>,
        group_id: impl Into<String>,
    ) -> Self {
        Self::new(
            protocol,
            ports,
            Peer::SecurityGroup {
                group_id: group_id.into(),
                user_id: None,
            },
        )
    }

    pub fn prefix_list(
        protocol: Protocol,
        ports: Option<PortRange>,
        prefix_list_id: impl Into<String>,
    ) -> Self {
        Self::new(protocol, ports, Peer::PrefixList(prefix_list_id.into()))
    }

    /// Builds one permission per peer, all sharing this permission's protocol,
    /// ports, description and labels.
    pub fn expand(&self, peers: impl IntoIterator<Item = Peer>) -> Vec<Self> {
        peers
            .into_iter()
            .map(|peer| Self {
                peer,
                ..self.clone()
            })
            .collect()
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }
}

impl Labeled for IpPermission {
    fn labels(&self) -> &Labels {
        &self.labels
    }
}

impl fmt::Display for IpPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ports {
            Some(ports) => write!(f, "{}:{} from {}", self.protocol, ports, self.peer),
            None => write!(f, "{} from {}", self.protocol, self.peer),
        }
    }
}

// === impl IpPermissionEquality ===

impl EqualityPolicy<IpPermission> for IpPermissionEquality {
    fn equivalent(&self, a: &IpPermission, b: &IpPermission) -> bool {
        a.protocol == b.protocol
            && eq_ports(a, b)
            && eq_peer(&a.peer, &b.peer)
            && eq_description(a.description.as_deref(), b.description.as_deref())
    }
}

fn eq_ports(a: &IpPermission, b: &IpPermission) -> bool {
    // Ports are meaningless for the all-protocols rule; the provider reports
    // them as absent or as -1.
    if !a.protocol.has_ports() {
        return true;
    }
    a.ports == b.ports
}

fn eq_peer(a: &Peer, b: &Peer) -> bool {
    match (a, b) {
        (Peer::Cidr(a), Peer::Cidr(b)) => a.trunc() == b.trunc(),
        (
            Peer::SecurityGroup {
                group_id: a,
                user_id: a_user,
            },
            Peer::SecurityGroup {
                group_id: b,
                user_id: b_user,
            },
        ) => {
            // The provider always reports the owning account; callers usually
            // leave it unset.
            a == b
                && match (a_user, b_user) {
                    (Some(a), Some(b)) => a == b,
                    _ => true,
                }
        }
        (Peer::PrefixList(a), Peer::PrefixList(b)) => a == b,
        _ => false,
    }
}

fn eq_description(a: Option<&str>, b: Option<&str>) -> bool {
    a.unwrap_or_default() == b.unwrap_or_default()
}
