pub(crate) mod server_selection;

#[cfg(test)]
pub(crate) mod test;

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::{
    client::session::ClusterTime,
    error::{Error, Result},
    options::{ClientOptions, ServerAddress},
    sdam::description::server::{ServerDescription, ServerType},
    selection_criteria::SelectionCriteria,
};

/// The possible types for a topology.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A load-balanced topology.
    LoadBalanced,

    /// A topology whose type is not known.
    Unknown,
}

impl Default for TopologyType {
    fn default() -> Self {
        TopologyType::Unknown
    }
}

/// The level of session support the deployment offers, derived from the logical session
/// timeouts advertised by its data-bearing servers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum SessionSupportStatus {
    /// No data-bearing servers have been seen yet.
    Undetermined,

    /// At least one data-bearing server does not support sessions.
    Unsupported,

    /// All data-bearing servers support sessions.
    Supported {
        /// The minimum logical session timeout across the deployment. A `None` here only
        /// occurs for load-balanced topologies, where the timeout is not advertised.
        logical_session_timeout: Option<Duration>,
    },
}

/// Whether the deployment supports multi-document transactions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum TransactionSupportStatus {
    Undetermined,
    Unsupported,
    Supported,
}

/// A description of the cluster: its type, and a description of each server it contains.
///
/// Descriptions are immutable snapshots from the reader's perspective: the topology worker
/// clones, mutates, and republishes, so any given value never changes after it is observed.
#[derive(Debug, Clone)]
pub(crate) struct TopologyDescription {
    /// Whether this topology was initialized from a single seed without a replica set name.
    pub(crate) single_seed: bool,

    /// The replica set name, learned from the options or the first member seen.
    pub(crate) set_name: Option<String>,

    /// The type of the topology.
    pub(crate) topology_type: TopologyType,

    /// The highest replica set version the driver has seen in a primary's hello reply.
    pub(crate) max_set_version: Option<i32>,

    /// The highest election id the driver has seen in a primary's hello reply.
    pub(crate) max_election_id: Option<ObjectId>,

    /// Describes how the deployment is incompatible with the driver, if it is.
    pub(crate) compatibility_error: Option<String>,

    pub(crate) session_support_status: SessionSupportStatus,

    pub(crate) transaction_support_status: TransactionSupportStatus,

    /// The highest cluster time the driver has gossiped with the deployment.
    pub(crate) cluster_time: Option<ClusterTime>,

    pub(crate) local_threshold: Option<Duration>,

    pub(crate) heartbeat_freq: Option<Duration>,

    /// The descriptions of each known server.
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        self.topology_type == other.topology_type
            && self.set_name == other.set_name
            && self.compatibility_error == other.compatibility_error
            && self.servers == other.servers
    }
}

impl TopologyDescription {
    pub(crate) fn new(options: &ClientOptions) -> Result<Self> {
        let topology_type = if options.direct_connection == Some(true) {
            TopologyType::Single
        } else if options.load_balanced == Some(true) {
            TopologyType::LoadBalanced
        } else if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };

        let servers: HashMap<_, _> = options
            .hosts
            .iter()
            .map(|address| (address.clone(), ServerDescription::new(address.clone())))
            .collect();

        Ok(Self {
            single_seed: servers.len() == 1,
            set_name: options.repl_set_name.clone(),
            topology_type,
            max_set_version: None,
            max_election_id: None,
            compatibility_error: None,
            session_support_status: SessionSupportStatus::Undetermined,
            transaction_support_status: TransactionSupportStatus::Undetermined,
            cluster_time: None,
            local_threshold: options.local_threshold,
            heartbeat_freq: options.heartbeat_freq,
            servers,
        })
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    pub(crate) fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub(crate) fn get_server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub(crate) fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// Replaces the stored cluster time if `cluster_time` is strictly greater; gossip never
    /// moves the cluster time backward.
    pub(crate) fn advance_cluster_time(&mut self, cluster_time: &ClusterTime) {
        if self.cluster_time.as_ref() < Some(cluster_time) {
            self.cluster_time = Some(cluster_time.clone());
        }
    }

    /// Applies the given server description, running the SDAM transition rules for the
    /// current topology type. Returns whether anything changed.
    pub(crate) fn update(&mut self, server_description: ServerDescription) -> Result<bool> {
        // Stale updates from servers no longer in the topology are discarded.
        if !self.servers.contains_key(&server_description.address) {
            return Ok(false);
        }

        // A reply that is not more recent than the stored topologyVersion arrived out of
        // order and is discarded.
        if let (Some(existing), Some(incoming)) = (
            self.servers
                .get(&server_description.address)
                .and_then(|server| server.topology_version()),
            server_description.topology_version(),
        ) {
            if !incoming.is_more_recent_than(existing) {
                return Ok(false);
            }
        }

        if let Some(existing) = self.servers.get(&server_description.address) {
            if existing == &server_description {
                // A same-contents update still refreshes RTT bookkeeping.
                self.servers
                    .insert(server_description.address.clone(), server_description);
                return Ok(false);
            }
        }

        let server_type = server_description.server_type;
        let server_address = server_description.address.clone();
        self.servers
            .insert(server_address.clone(), server_description);

        match (self.topology_type, server_type) {
            (TopologyType::LoadBalanced, _) | (TopologyType::Single, _) => {}
            (_, ServerType::Unknown) | (_, ServerType::RsGhost) => {
                if self.topology_type == TopologyType::ReplicaSetWithPrimary {
                    self.check_if_has_primary();
                }
            }
            (TopologyType::Unknown, ServerType::Standalone) => {
                self.update_unknown_with_standalone_server(&server_address)
            }
            (TopologyType::Unknown, ServerType::Mongos) => {
                self.topology_type = TopologyType::Sharded
            }
            (TopologyType::Unknown, ServerType::RsPrimary) => {
                self.update_rs_from_primary(&server_address)?
            }
            (TopologyType::Unknown, _) => {
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.update_rs_without_primary(&server_address)?;
            }
            (TopologyType::Sharded, ServerType::Mongos) => {}
            (TopologyType::Sharded, _) => {
                self.servers.remove(&server_address);
            }
            (TopologyType::ReplicaSetNoPrimary, ServerType::Standalone)
            | (TopologyType::ReplicaSetNoPrimary, ServerType::Mongos) => {
                self.servers.remove(&server_address);
            }
            (TopologyType::ReplicaSetNoPrimary, ServerType::RsPrimary) => {
                self.update_rs_from_primary(&server_address)?
            }
            (TopologyType::ReplicaSetNoPrimary, _) => {
                self.update_rs_without_primary(&server_address)?
            }
            (TopologyType::ReplicaSetWithPrimary, ServerType::Standalone)
            | (TopologyType::ReplicaSetWithPrimary, ServerType::Mongos) => {
                self.servers.remove(&server_address);
                self.check_if_has_primary();
            }
            (TopologyType::ReplicaSetWithPrimary, ServerType::RsPrimary) => {
                self.update_rs_from_primary(&server_address)?
            }
            (TopologyType::ReplicaSetWithPrimary, _) => {
                self.update_rs_with_primary_from_member(&server_address)?
            }
        }

        self.update_compatibility_error();
        self.update_session_support_status();
        self.update_transaction_support_status();

        Ok(true)
    }

    /// Sets the topology type based on whether any primary is currently known.
    fn check_if_has_primary(&mut self) {
        if self.primary_address().is_some() {
            self.topology_type = TopologyType::ReplicaSetWithPrimary;
        } else {
            self.topology_type = TopologyType::ReplicaSetNoPrimary;
        }
    }

    fn primary_address(&self) -> Option<ServerAddress> {
        self.servers
            .values()
            .find(|server| server.server_type == ServerType::RsPrimary)
            .map(|server| server.address.clone())
    }

    fn update_unknown_with_standalone_server(&mut self, server_address: &ServerAddress) {
        if self.single_seed {
            self.topology_type = TopologyType::Single;
        } else {
            self.servers.remove(server_address);
        }
    }

    fn update_rs_without_primary(&mut self, server_address: &ServerAddress) -> Result<()> {
        let description = match self.servers.get(server_address) {
            Some(description) => description.clone(),
            None => return Ok(()),
        };

        match (self.set_name.as_deref(), description.set_name()) {
            (None, Some(name)) => self.set_name = Some(name.to_string()),
            (Some(existing), Some(name)) if existing != name => {
                self.servers.remove(server_address);
                return Ok(());
            }
            (_, None) => {}
            _ => {}
        }

        self.add_new_servers(description.known_hosts()?);

        if let Some(me) = description.me() {
            if server_address.to_string().to_lowercase() != me {
                self.servers.remove(server_address);
            }
        }

        Ok(())
    }

    fn update_rs_with_primary_from_member(&mut self, server_address: &ServerAddress) -> Result<()> {
        let description = match self.servers.get(server_address) {
            Some(description) => description.clone(),
            None => return Ok(()),
        };

        if self.set_name.as_deref() != description.set_name() {
            self.servers.remove(server_address);
            self.check_if_has_primary();
            return Ok(());
        }

        if let Some(me) = description.me() {
            if server_address.to_string().to_lowercase() != me {
                self.servers.remove(server_address);
            }
        }

        // The member may be a former primary now reporting as something else.
        self.check_if_has_primary();
        Ok(())
    }

    fn update_rs_from_primary(&mut self, server_address: &ServerAddress) -> Result<()> {
        let description = match self.servers.get(server_address) {
            Some(description) => description.clone(),
            None => return Ok(()),
        };

        match (self.set_name.as_deref(), description.set_name()) {
            (None, Some(name)) => self.set_name = Some(name.to_string()),
            (Some(existing), Some(name)) if existing != name => {
                // The server is from a different replica set entirely.
                self.servers.remove(server_address);
                self.check_if_has_primary();
                return Ok(());
            }
            _ => {}
        }

        if let Some(server_set_version) = description.set_version() {
            if let Some(server_election_id) = description.election_id() {
                let stale = match (self.max_set_version, self.max_election_id) {
                    (Some(max_set_version), Some(max_election_id)) => {
                        max_set_version > server_set_version
                            || (max_set_version == server_set_version
                                && max_election_id > server_election_id)
                    }
                    _ => false,
                };
                if stale {
                    // This primary lost an election it hasn't noticed yet.
                    self.mark_server_as_unknown(
                        server_address,
                        "primary marked stale due to electionId/setVersion mismatch",
                    );
                    self.check_if_has_primary();
                    return Ok(());
                }
                self.max_election_id = Some(server_election_id);
            }

            if self
                .max_set_version
                .map_or(true, |max| server_set_version > max)
            {
                self.max_set_version = Some(server_set_version);
            }
        }

        // Any other server still marked primary is now stale.
        let other_primaries: Vec<ServerAddress> = self
            .servers
            .iter()
            .filter(|(address, server)| {
                *address != server_address && server.server_type == ServerType::RsPrimary
            })
            .map(|(address, _)| address.clone())
            .collect();
        for address in other_primaries {
            self.mark_server_as_unknown(
                &address,
                "primary marked stale due to discovery of newer primary",
            );
        }

        let known_hosts = description.known_hosts()?;
        self.add_new_servers(known_hosts.clone());

        let host_set: HashSet<ServerAddress> = known_hosts.into_iter().collect();
        self.servers
            .retain(|address, _| host_set.contains(address) || address == server_address);
        if !host_set.contains(server_address) {
            self.servers.remove(server_address);
        }

        self.check_if_has_primary();
        Ok(())
    }

    fn mark_server_as_unknown(&mut self, address: &ServerAddress, cause: &str) {
        let description =
            ServerDescription::new_from_error(address.clone(), &Error::internal(cause));
        self.servers.insert(address.clone(), description);
    }

    fn add_new_servers(&mut self, addresses: impl IntoIterator<Item = ServerAddress>) {
        for address in addresses {
            self.servers
                .entry(address.clone())
                .or_insert_with(|| ServerDescription::new(address));
        }
    }

    /// The intersection of the wire version ranges of all known servers determines whether
    /// the deployment is usable; an empty intersection fails every operation fast.
    fn update_compatibility_error(&mut self) {
        self.compatibility_error = self
            .servers
            .values()
            .find_map(|server| server.compatibility_error_message());
    }

    fn update_session_support_status(&mut self) {
        if self.topology_type == TopologyType::LoadBalanced {
            self.session_support_status = SessionSupportStatus::Supported {
                logical_session_timeout: None,
            };
            return;
        }

        let data_bearing: Vec<&ServerDescription> = self
            .servers
            .values()
            .filter(|server| server.server_type.is_data_bearing())
            .collect();

        if data_bearing.is_empty() {
            // Leave any previously determined status in place until a data-bearing server
            // reappears.
            return;
        }

        let mut min_timeout: Option<Duration> = None;
        for server in data_bearing {
            match server.logical_session_timeout() {
                Some(timeout) => {
                    min_timeout = Some(match min_timeout {
                        Some(min) => min.min(timeout),
                        None => timeout,
                    });
                }
                None => {
                    self.session_support_status = SessionSupportStatus::Unsupported;
                    return;
                }
            }
        }

        self.session_support_status = SessionSupportStatus::Supported {
            logical_session_timeout: min_timeout,
        };
    }

    fn update_transaction_support_status(&mut self) {
        self.transaction_support_status = match self.session_support_status {
            SessionSupportStatus::Undetermined => TransactionSupportStatus::Undetermined,
            SessionSupportStatus::Unsupported => TransactionSupportStatus::Unsupported,
            SessionSupportStatus::Supported { .. } => {
                let all_support_transactions = self
                    .servers
                    .values()
                    .filter(|server| server.server_type.is_data_bearing())
                    .all(|server| server.max_wire_version().unwrap_or(0) >= 7);
                if all_support_transactions {
                    TransactionSupportStatus::Supported
                } else {
                    TransactionSupportStatus::Unsupported
                }
            }
        }
    }

    /// Syncs the set of known servers to `hosts`, used when reconciling the topology against
    /// an updated host list.
    pub(crate) fn sync_hosts(&mut self, hosts: &HashSet<ServerAddress>) {
        self.add_new_servers(hosts.iter().cloned());
        self.servers.retain(|address, _| hosts.contains(address));
    }

    /// The changes between `previous` and this description, or `None` if they are identical.
    pub(crate) fn diff<'a>(
        &'a self,
        previous: &'a TopologyDescription,
    ) -> Option<TopologyDescriptionDiff<'a>> {
        if self == previous {
            return None;
        }

        let addresses: HashSet<&ServerAddress> = self.server_addresses().collect();
        let previous_addresses: HashSet<&ServerAddress> =
            previous.server_addresses().collect();

        let added_addresses = addresses.difference(&previous_addresses).cloned().collect();
        let removed_addresses = previous_addresses.difference(&addresses).cloned().collect();

        let changed_servers = self
            .servers
            .iter()
            .filter_map(|(address, description)| match previous.servers.get(address) {
                Some(previous_description) if previous_description != description => {
                    Some((address, (previous_description, description)))
                }
                _ => None,
            })
            .collect();

        Some(TopologyDescriptionDiff {
            removed_addresses,
            added_addresses,
            changed_servers,
        })
    }

    /// The error message reported when server selection times out against this topology.
    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        if let Some(ref compatibility_error) = self.compatibility_error {
            return compatibility_error.clone();
        }
        format!(
            "Server selection timeout: None of the available servers suitable for criteria \
             {:?}. Topology: {}",
            criteria,
            self.summary_string(),
        )
    }

    fn summary_string(&self) -> String {
        let servers: Vec<String> = self
            .servers
            .values()
            .map(|server| {
                let status = match server.error_message() {
                    Some(error) => format!("{:?} (error: {})", server.server_type, error),
                    None => format!("{:?}", server.server_type),
                };
                format!("{{ address: {}, type: {} }}", server.address, status)
            })
            .collect();
        format!(
            "{{ type: {:?}, servers: [ {} ] }}",
            self.topology_type,
            servers.join(", ")
        )
    }
}

/// The changes from one topology description to the next.
#[derive(Debug)]
pub(crate) struct TopologyDescriptionDiff<'a> {
    pub(crate) removed_addresses: HashSet<&'a ServerAddress>,
    pub(crate) added_addresses: HashSet<&'a ServerAddress>,
    pub(crate) changed_servers:
        HashMap<&'a ServerAddress, (&'a ServerDescription, &'a ServerDescription)>,
}
