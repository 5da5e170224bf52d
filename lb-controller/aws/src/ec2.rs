//! Security group rules backed by the EC2 API.

use ahash::AHashMap as HashMap;
use anyhow::{bail, Context, Result};
use ipnet::IpNet;
use lb_controller_core::{
    labels::Labels,
    security_group::{SecurityGroupInfo, SecurityGroupManager},
    Peer, PortRange, Protocol,
};

type Permission = lb_controller_core::IpPermission;

/// A rule as the EC2 API represents it: one protocol and port range shared by
/// any number of peers, each with its own description.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IpPermission {
    pub ip_protocol: String,
    pub from_port: Option<i32>,
    pub to_port: Option<i32>,
    pub ip_ranges: Vec<IpRange>,
    pub ipv6_ranges: Vec<Ipv6Range>,
    pub user_id_group_pairs: Vec<UserIdGroupPair>,
    pub prefix_list_ids: Vec<PrefixListId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IpRange {
    pub cidr_ip: String,
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ipv6Range {
    pub cidr_ipv6: String,
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserIdGroupPair {
    pub group_id: String,
    pub user_id: Option<String>,
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrefixListId {
    pub prefix_list_id: String,
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecurityGroup {
    pub group_id: String,
    pub ip_permissions: Vec<IpPermission>,
    pub ip_permissions_egress: Vec<IpPermission>,
    pub tags: Vec<Tag>,
}

/// The subset of the EC2 API needed to manage security group rules.
///
/// Implementations are expected to apply request throttling and transport
/// retries themselves.
#[async_trait::async_trait]
pub trait Ec2Client: Send + Sync {
    async fn describe_security_groups(&self, group_ids: &[&str]) -> Result<Vec<SecurityGroup>>;

    async fn authorize_security_group_ingress(
        &self,
        group_id: &str,
        ip_permissions: Vec<IpPermission>,
    ) -> Result<()>;

    async fn revoke_security_group_ingress(
        &self,
        group_id: &str,
        ip_permissions: Vec<IpPermission>,
    ) -> Result<()>;

    async fn authorize_security_group_egress(
        &self,
        group_id: &str,
        ip_permissions: Vec<IpPermission>,
    ) -> Result<()>;

    async fn revoke_security_group_egress(
        &self,
        group_id: &str,
        ip_permissions: Vec<IpPermission>,
    ) -> Result<()>;
}

/// Manages security group rules through an [`Ec2Client`].
///
/// EC2 stores no labels on a rule, only a free-form description per peer.
/// Labels are parsed back out of that description on fetch (see
/// [`labels_from_description`]), so a rule's ownership labels must also be
/// written into its description as `key=value` pairs. Labels that only live
/// on the granted permission are lost, and selectors will not match the rule
/// when it is next observed.
#[derive(Clone, Debug)]
pub struct Ec2SecurityGroupManager<C> {
    client: C,
}

/// Parses ownership labels out of a rule description of the form
/// `key=value,key=value`. Segments that are not pairs are ignored.
pub fn labels_from_description(description: Option<&str>) -> Labels {
    description
        .into_iter()
        .flat_map(|d| d.split(','))
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

// === impl Ec2SecurityGroupManager ===

impl<C> Ec2SecurityGroupManager<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

/// Counts the permissions carrying labels that their description does not
/// record.
fn unrecorded_labels(permissions: &[Permission]) -> usize {
    permissions
        .iter()
        .filter(|p| {
            let recorded = labels_from_description(p.description.as_deref());
            p.labels
                .as_ref()
                .iter()
                .any(|(k, v)| recorded.get(k) != Some(v.as_str()))
        })
        .count()
}

fn log_unrecorded_labels(id: &str, permissions: &[Permission]) {
    let unrecorded = unrecorded_labels(permissions);
    if unrecorded > 0 {
        tracing::debug!(
            %id,
            unrecorded,
            "Granted labels are not recorded in rule descriptions"
        );
    }
}

#[async_trait::async_trait]
impl<C: Ec2Client> SecurityGroupManager for Ec2SecurityGroupManager<C> {
    async fn fetch_sg_infos_by_id(
        &self,
        ids: &[&str],
    ) -> Result<HashMap<String, SecurityGroupInfo>> {
        let groups = self.client.describe_security_groups(ids).await?;
        let infos = groups
            .into_iter()
            .map(|sg| -> Result<(String, SecurityGroupInfo)> {
                let info = security_group_info(sg)?;
                Ok((info.id.clone(), info))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        if let Some(missing) = ids.iter().find(|id| !infos.contains_key(**id)) {
            bail!("InvalidGroup.NotFound: security group {missing} was not described");
        }
        tracing::trace!(groups = infos.len(), "Described security groups");
        Ok(infos)
    }

    async fn authorize_sg_ingress(&self, id: &str, permissions: Vec<Permission>) -> Result<()> {
        let ip_permissions = collapse(&permissions);
        tracing::debug!(%id, rules = permissions.len(), "Authorizing ingress");
        log_unrecorded_labels(id, &permissions);
        self.client
            .authorize_security_group_ingress(id, ip_permissions)
            .await
    }

    async fn revoke_sg_ingress(&self, id: &str, permissions: Vec<Permission>) -> Result<()> {
        let ip_permissions = collapse(&permissions);
        tracing::debug!(%id, rules = permissions.len(), "Revoking ingress");
        self.client
            .revoke_security_group_ingress(id, ip_permissions)
            .await
    }

    async fn authorize_sg_egress(&self, id: &str, permissions: Vec<Permission>) -> Result<()> {
        let ip_permissions = collapse(&permissions);
        tracing::debug!(%id, rules = permissions.len(), "Authorizing egress");
        log_unrecorded_labels(id, &permissions);
        self.client
            .authorize_security_group_egress(id, ip_permissions)
            .await
    }

    async fn revoke_sg_egress(&self, id: &str, permissions: Vec<Permission>) -> Result<()> {
        let ip_permissions = collapse(&permissions);
        tracing::debug!(%id, rules = permissions.len(), "Revoking egress");
        self.client
            .revoke_security_group_egress(id, ip_permissions)
            .await
    }
}

fn security_group_info(sg: SecurityGroup) -> Result<SecurityGroupInfo> {
    let SecurityGroup {
        group_id,
        ip_permissions,
        ip_permissions_egress,
        tags,
    } = sg;

    let ingress = expand_all(ip_permissions)
        .with_context(|| format!("invalid ingress rule on {group_id}"))?;
    let egress = expand_all(ip_permissions_egress)
        .with_context(|| format!("invalid egress rule on {group_id}"))?;
    let tags = tags.into_iter().map(|Tag { key, value }| (key, value)).collect();

    Ok(SecurityGroupInfo {
        id: group_id,
        ingress,
        egress,
        tags,
    })
}

fn expand_all(ip_permissions: Vec<IpPermission>) -> Result<Vec<Permission>> {
    let mut permissions = Vec::new();
    for ip_permission in ip_permissions {
        permissions.extend(expand(ip_permission)?);
    }
    Ok(permissions)
}

/// Splits a wire rule into one permission per peer.
fn expand(ip_permission: IpPermission) -> Result<Vec<Permission>> {
    let IpPermission {
        ip_protocol,
        from_port,
        to_port,
        ip_ranges,
        ipv6_ranges,
        user_id_group_pairs,
        prefix_list_ids,
    } = ip_permission;

    let protocol = ip_protocol.parse::<Protocol>()?;
    let ports = match (from_port, to_port) {
        (Some(from), Some(to)) if protocol.has_ports() => Some(PortRange::new(from, to)),
        _ => None,
    };
    let permission = |peer: Peer, description: Option<String>| Permission {
        protocol,
        ports,
        peer,
        labels: labels_from_description(description.as_deref()),
        description,
    };

    let mut permissions = Vec::new();
    for IpRange { cidr_ip, description } in ip_ranges {
        let net = parse_net(&cidr_ip)?;
        permissions.push(permission(Peer::Cidr(net), description));
    }
    for Ipv6Range {
        cidr_ipv6,
        description,
    } in ipv6_ranges
    {
        let net = parse_net(&cidr_ipv6)?;
        permissions.push(permission(Peer::Cidr(net), description));
    }
    for UserIdGroupPair {
        group_id,
        user_id,
        description,
    } in user_id_group_pairs
    {
        permissions.push(permission(Peer::SecurityGroup { group_id, user_id }, description));
    }
    for PrefixListId {
        prefix_list_id,
        description,
    } in prefix_list_ids
    {
        permissions.push(permission(Peer::PrefixList(prefix_list_id), description));
    }
    Ok(permissions)
}

fn parse_net(cidr: &str) -> Result<IpNet> {
    cidr.parse()
        .with_context(|| format!("invalid CIDR {cidr:?}"))
}

/// Groups permissions sharing a protocol and port range into wire rules, in
/// first-seen order. Labels are dropped.
fn collapse(permissions: &[Permission]) -> Vec<IpPermission> {
    let mut slots: Vec<(Protocol, Option<PortRange>)> = Vec::new();
    let mut ip_permissions: Vec<IpPermission> = Vec::new();

    for permission in permissions {
        let slot = (permission.protocol, permission.ports);
        let idx = match slots.iter().position(|s| *s == slot) {
            Some(idx) => idx,
            None => {
                slots.push(slot);
                ip_permissions.push(IpPermission {
                    ip_protocol: permission.protocol.to_string(),
                    from_port: permission.ports.map(|p| p.from),
                    to_port: permission.ports.map(|p| p.to),
                    ..Default::default()
                });
                ip_permissions.len() - 1
            }
        };

        let ip_permission = &mut ip_permissions[idx];
        let description = permission.description.clone();
        match &permission.peer {
            Peer::Cidr(IpNet::V4(net)) => ip_permission.ip_ranges.push(IpRange {
                cidr_ip: net.to_string(),
                description,
            }),
            Peer::Cidr(IpNet::V6(net)) => ip_permission.ipv6_ranges.push(Ipv6Range {
                cidr_ipv6: net.to_string(),
                description,
            }),
            Peer::SecurityGroup { group_id, user_id } => {
                ip_permission.user_id_group_pairs.push(UserIdGroupPair {
                    group_id: group_id.clone(),
                    user_id: user_id.clone(),
                    description,
                })
            }
            Peer::PrefixList(prefix_list_id) => ip_permission.prefix_list_ids.push(PrefixListId {
                prefix_list_id: prefix_list_id.clone(),
                description,
            }),
        }
    }

    ip_permissions
}

#[cfg(test)]
mod tests {
    use super::*;
    use lb_controller_core::{
        reconcile::ReconcileOptions, security_group::SecurityGroupReconciler, Selector,
    };
    use maplit::btreemap;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Request {
        Describe(Vec<String>),
        AuthorizeIngress(String, Vec<IpPermission>),
        RevokeIngress(String, Vec<IpPermission>),
        AuthorizeEgress(String, Vec<IpPermission>),
        RevokeEgress(String, Vec<IpPermission>),
    }

    #[derive(Clone, Default)]
    struct MockClient {
        groups: Vec<SecurityGroup>,
        requests: Arc<Mutex<Vec<Request>>>,
    }

    #[async_trait::async_trait]
    impl Ec2Client for MockClient {
        async fn describe_security_groups(
            &self,
            group_ids: &[&str],
        ) -> Result<Vec<SecurityGroup>> {
            self.requests.lock().push(Request::Describe(
                group_ids.iter().map(|id| id.to_string()).collect(),
            ));
            Ok(self
                .groups
                .iter()
                .filter(|sg| group_ids.contains(&sg.group_id.as_str()))
                .cloned()
                .collect())
        }

        async fn authorize_security_group_ingress(
            &self,
            group_id: &str,
            ip_permissions: Vec<IpPermission>,
        ) -> Result<()> {
            self.requests
                .lock()
                .push(Request::AuthorizeIngress(group_id.to_string(), ip_permissions));
            Ok(())
        }

        async fn revoke_security_group_ingress(
            &self,
            group_id: &str,
            ip_permissions: Vec<IpPermission>,
        ) -> Result<()> {
            self.requests
                .lock()
                .push(Request::RevokeIngress(group_id.to_string(), ip_permissions));
            Ok(())
        }

        async fn authorize_security_group_egress(
            &self,
            group_id: &str,
            ip_permissions: Vec<IpPermission>,
        ) -> Result<()> {
            self.requests
                .lock()
                .push(Request::AuthorizeEgress(group_id.to_string(), ip_permissions));
            Ok(())
        }

        async fn revoke_security_group_egress(
            &self,
            group_id: &str,
            ip_permissions: Vec<IpPermission>,
        ) -> Result<()> {
            self.requests
                .lock()
                .push(Request::RevokeEgress(group_id.to_string(), ip_permissions));
            Ok(())
        }
    }

    fn https_from(cidr_ip: &str, description: Option<&str>) -> IpPermission {
        IpPermission {
            ip_protocol: "tcp".to_string(),
            from_port: Some(443),
            to_port: Some(443),
            ip_ranges: vec![IpRange {
                cidr_ip: cidr_ip.to_string(),
                description: description.map(Into::into),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn parses_labels_from_description() {
        assert_eq!(
            labels_from_description(Some("elbv2.k8s.aws/managed-by=lbc, stack = web,free text")),
            Labels::from(btreemap! {
                "elbv2.k8s.aws/managed-by".to_string() => "lbc".to_string(),
                "stack".to_string() => "web".to_string(),
            })
        );
        assert!(labels_from_description(Some("allow https")).is_empty());
        assert!(labels_from_description(Some("=orphan")).is_empty());
        assert!(labels_from_description(None).is_empty());
    }

    #[tokio::test]
    async fn fetch_expands_one_permission_per_peer() {
        let client = MockClient {
            groups: vec![SecurityGroup {
                group_id: "sg-1".to_string(),
                ip_permissions: vec![IpPermission {
                    ip_protocol: "tcp".to_string(),
                    from_port: Some(80),
                    to_port: Some(80),
                    ip_ranges: vec![IpRange {
                        cidr_ip: "10.0.0.0/8".to_string(),
                        description: Some("owner=lbc".to_string()),
                    }],
                    ipv6_ranges: vec![Ipv6Range {
                        cidr_ipv6: "2001:db8::/32".to_string(),
                        description: None,
                    }],
                    user_id_group_pairs: vec![UserIdGroupPair {
                        group_id: "sg-2".to_string(),
                        user_id: Some("123456789012".to_string()),
                        description: None,
                    }],
                    prefix_list_ids: vec![PrefixListId {
                        prefix_list_id: "pl-1".to_string(),
                        description: None,
                    }],
                }],
                ip_permissions_egress: vec![IpPermission {
                    ip_protocol: "-1".to_string(),
                    ip_ranges: vec![IpRange {
                        cidr_ip: "0.0.0.0/0".to_string(),
                        description: None,
                    }],
                    ..Default::default()
                }],
                tags: vec![Tag {
                    key: "Name".to_string(),
                    value: "web".to_string(),
                }],
            }],
            ..Default::default()
        };
        let manager = Ec2SecurityGroupManager::new(client);

        let mut infos = manager.fetch_sg_infos_by_id(&["sg-1"]).await.unwrap();
        let info = infos.remove("sg-1").expect("sg-1 must be present");

        let http = Some(PortRange::single(80));
        let owned: Labels = Some(("owner", "lbc")).into_iter().collect();
        assert_eq!(
            info.ingress,
            vec![
                Permission::cidr(Protocol::Tcp, http, "10.0.0.0/8".parse().unwrap())
                    .with_description("owner=lbc")
                    .with_labels(owned),
                Permission::cidr(Protocol::Tcp, http, "2001:db8::/32".parse().unwrap()),
                Permission::new(
                    Protocol::Tcp,
                    http,
                    Peer::SecurityGroup {
                        group_id: "sg-2".to_string(),
                        user_id: Some("123456789012".to_string()),
                    }
                ),
                Permission::prefix_list(Protocol::Tcp, http, "pl-1"),
            ]
        );
        assert_eq!(
            info.egress,
            vec![Permission::cidr(
                Protocol::All,
                None,
                "0.0.0.0/0".parse().unwrap()
            )]
        );
        assert_eq!(info.tags.get("Name").map(String::as_str), Some("web"));
    }

    #[tokio::test]
    async fn fetch_fails_when_a_group_is_missing() {
        let client = MockClient {
            groups: vec![SecurityGroup {
                group_id: "sg-1".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let manager = Ec2SecurityGroupManager::new(client);

        let error = manager
            .fetch_sg_infos_by_id(&["sg-1", "sg-2"])
            .await
            .expect_err("sg-2 does not exist");
        assert!(error.to_string().contains("sg-2"), "{error}");
    }

    #[tokio::test]
    async fn fetch_rejects_malformed_rules() {
        let client = MockClient {
            groups: vec![SecurityGroup {
                group_id: "sg-1".to_string(),
                ip_permissions: vec![IpPermission {
                    ip_protocol: "sctp-ish".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        let manager = Ec2SecurityGroupManager::new(client);

        assert!(manager.fetch_sg_infos_by_id(&["sg-1"]).await.is_err());
    }

    #[test]
    fn counts_labels_missing_from_description() {
        let owned: Labels = Some(("owner", "lbc")).into_iter().collect();
        let https = Permission::cidr(
            Protocol::Tcp,
            Some(PortRange::single(443)),
            "10.0.0.0/8".parse().unwrap(),
        );
        let permissions = vec![
            https.clone(),
            https.clone().with_labels(owned.clone()),
            https.clone().with_labels(owned.clone()).with_description("owner=ops"),
            https.clone().with_labels(owned).with_description("owner=lbc,stack=web"),
        ];
        assert_eq!(unrecorded_labels(&permissions), 2);
        assert_eq!(unrecorded_labels(&permissions[3..]), 0);
    }

    #[tokio::test]
    async fn mutations_collapse_by_protocol_and_ports() {
        let client = MockClient::default();
        let manager = Ec2SecurityGroupManager::new(client.clone());

        let owned: Labels = Some(("owner", "lbc")).into_iter().collect();
        let https = Permission::cidr(
            Protocol::Tcp,
            Some(PortRange::single(443)),
            "10.0.0.0/8".parse().unwrap(),
        )
        .with_labels(owned);
        let mut permissions = https.expand(vec![
            Peer::Cidr("10.0.0.0/8".parse().unwrap()),
            Peer::Cidr("fd00::/8".parse().unwrap()),
        ]);
        permissions.push(Permission::security_group(
            Protocol::Udp,
            Some(PortRange::single(53)),
            "sg-dns",
        ));
        manager
            .authorize_sg_ingress("sg-1", permissions)
            .await
            .unwrap();

        assert_eq!(
            client.requests.lock().clone(),
            vec![Request::AuthorizeIngress(
                "sg-1".to_string(),
                vec![
                    IpPermission {
                        ip_protocol: "tcp".to_string(),
                        from_port: Some(443),
                        to_port: Some(443),
                        ip_ranges: vec![IpRange {
                            cidr_ip: "10.0.0.0/8".to_string(),
                            description: None,
                        }],
                        ipv6_ranges: vec![Ipv6Range {
                            cidr_ipv6: "fd00::/8".to_string(),
                            description: None,
                        }],
                        ..Default::default()
                    },
                    IpPermission {
                        ip_protocol: "udp".to_string(),
                        from_port: Some(53),
                        to_port: Some(53),
                        user_id_group_pairs: vec![UserIdGroupPair {
                            group_id: "sg-dns".to_string(),
                            user_id: None,
                            description: None,
                        }],
                        ..Default::default()
                    },
                ]
            )]
        );
    }

    #[tokio::test]
    async fn reconciles_through_the_client() {
        let client = MockClient {
            groups: vec![SecurityGroup {
                group_id: "sg-1".to_string(),
                ip_permissions: vec![
                    https_from("0.0.0.0/0", Some("owner=lbc")),
                    https_from("192.168.0.0/16", Some("hand-made")),
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        let reconciler =
            SecurityGroupReconciler::new(Ec2SecurityGroupManager::new(client.clone()));

        let desired = Permission::cidr(
            Protocol::Tcp,
            Some(PortRange::single(443)),
            "10.0.0.0/8".parse().unwrap(),
        )
        .with_description("owner=lbc");
        let selector: Selector = "owner=lbc".parse().unwrap();
        reconciler
            .reconcile_ingress(
                "sg-1",
                &[desired],
                ReconcileOptions::default().with_selector(selector),
            )
            .await
            .unwrap();

        assert_eq!(
            client.requests.lock().clone(),
            vec![
                Request::Describe(vec!["sg-1".to_string()]),
                Request::RevokeIngress(
                    "sg-1".to_string(),
                    vec![https_from("0.0.0.0/0", Some("owner=lbc"))]
                ),
                Request::AuthorizeIngress(
                    "sg-1".to_string(),
                    vec![https_from("10.0.0.0/8", Some("owner=lbc"))]
                ),
            ]
        );
    }
}
