#[cfg(test)]
mod test;

use std::{collections::HashMap, sync::Arc, time::Duration};

use rand::seq::IteratorRandom;

use super::TopologyDescription;
use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    sdam::{
        description::server::{ServerDescription, ServerType},
        SelectedServer, Server,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);
pub(crate) const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// Attempts to select a server matching `criteria` from the given topology, returning `None`
/// when no server is currently suitable (the caller waits for a topology change and retries).
///
/// Servers in `deprioritized` are skipped when any other candidate exists; deprioritization
/// never blocks an otherwise viable selection.
pub(crate) fn attempt_to_select_server<'a>(
    criteria: &'a SelectionCriteria,
    topology_description: &'a TopologyDescription,
    servers: &'a HashMap<ServerAddress, Arc<Server>>,
    deprioritized: &[ServerAddress],
) -> Result<Option<SelectedServer>> {
    let in_window = topology_description.suitable_servers_in_latency_window(criteria)?;

    let preferred: Vec<&ServerDescription> = in_window
        .iter()
        .filter(|description| !deprioritized.contains(&description.address))
        .copied()
        .collect();
    let candidates = if preferred.is_empty() {
        in_window
    } else {
        preferred
    };

    let selected = candidates.into_iter().choose(&mut rand::thread_rng());
    Ok(selected.and_then(|description| {
        servers
            .get(&description.address)
            .map(|server| SelectedServer::new(server.clone()))
    }))
}

impl TopologyDescription {
    /// The servers suitable for `criteria` whose round trip time falls within the local
    /// threshold window around the fastest candidate.
    pub(crate) fn suitable_servers_in_latency_window(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Vec<&ServerDescription>> {
        if let Some(ref message) = self.compatibility_error {
            return Err(ErrorKind::IncompatibleServer {
                message: message.clone(),
            }
            .into());
        }

        let mut suitable = self.suitable_servers(criteria)?;
        if self.topology_type == super::TopologyType::LoadBalanced {
            return Ok(suitable);
        }
        self.retain_servers_within_latency_window(&mut suitable);
        Ok(suitable)
    }

    fn suitable_servers(&self, criteria: &SelectionCriteria) -> Result<Vec<&ServerDescription>> {
        let servers = match (self.topology_type, criteria) {
            (super::TopologyType::Unknown, _) => Vec::new(),
            (super::TopologyType::Single, _) | (super::TopologyType::LoadBalanced, _) => {
                self.servers.values().collect()
            }
            (super::TopologyType::Sharded, SelectionCriteria::ReadPreference(_)) => {
                self.servers_with_type(&[ServerType::Mongos]).collect()
            }
            (_, SelectionCriteria::ReadPreference(ref read_pref)) => {
                self.suitable_servers_in_replica_set(read_pref)?
            }
            (_, SelectionCriteria::Predicate(ref filter)) => self
                .servers
                .values()
                .filter(|description| {
                    description.is_available()
                        && filter(&crate::sdam::public::ServerInfo::new_borrowed(description))
                })
                .collect(),
        };

        Ok(servers)
    }

    fn retain_servers_within_latency_window(&self, suitable: &mut Vec<&ServerDescription>) {
        let shortest_average_rtt = suitable
            .iter()
            .filter_map(|description| description.average_round_trip_time)
            .min();

        let local_threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);

        let max_rtt_within_window = shortest_average_rtt.map(|rtt| rtt + local_threshold);

        suitable.retain(move |description| {
            description
                .average_round_trip_time
                .and_then(|rtt| max_rtt_within_window.map(|max| rtt <= max))
                .unwrap_or(false)
        });
    }

    fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |description| types.contains(&description.server_type))
    }

    fn suitable_servers_in_replica_set(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let servers = match read_preference {
            ReadPreference::Primary => self.servers_with_type(&[ServerType::RsPrimary]).collect(),
            ReadPreference::Secondary { ref options } => self
                .suitable_servers_for_read_preference(
                    &[ServerType::RsSecondary],
                    options.tag_sets.as_ref(),
                    options.max_staleness,
                )?,
            ReadPreference::PrimaryPreferred { ref options } => {
                match self.servers_with_type(&[ServerType::RsPrimary]).next() {
                    Some(primary) => vec![primary],
                    None => self.suitable_servers_for_read_preference(
                        &[ServerType::RsSecondary],
                        options.tag_sets.as_ref(),
                        options.max_staleness,
                    )?,
                }
            }
            ReadPreference::SecondaryPreferred { ref options } => {
                let suitable_servers = self.suitable_servers_for_read_preference(
                    &[ServerType::RsSecondary],
                    options.tag_sets.as_ref(),
                    options.max_staleness,
                )?;
                if suitable_servers.is_empty() {
                    self.servers_with_type(&[ServerType::RsPrimary]).collect()
                } else {
                    suitable_servers
                }
            }
            ReadPreference::Nearest { ref options } => self.suitable_servers_for_read_preference(
                &[ServerType::RsPrimary, ServerType::RsSecondary],
                options.tag_sets.as_ref(),
                options.max_staleness,
            )?,
        };

        Ok(servers)
    }

    fn suitable_servers_for_read_preference<'a>(
        &'a self,
        types: &'a [ServerType],
        tag_sets: Option<&Vec<TagSet>>,
        max_staleness: Option<Duration>,
    ) -> Result<Vec<&'a ServerDescription>> {
        if let Some(max_staleness) = max_staleness {
            verify_max_staleness(max_staleness, self.heartbeat_frequency())?;
        }

        let mut servers: Vec<&ServerDescription> = self.servers_with_type(types).collect();

        if let Some(max_staleness) = max_staleness {
            // According to the spec, we filter by staleness before applying tag filters.
            self.filter_servers_by_max_staleness(&mut servers, max_staleness);
        }

        if let Some(tag_sets) = tag_sets {
            filter_servers_by_tag_sets(&mut servers, tag_sets);
        }

        Ok(servers)
    }

    fn filter_servers_by_max_staleness(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let primary = self
            .servers
            .values()
            .find(|description| description.server_type == ServerType::RsPrimary);

        match primary {
            Some(primary) => self.filter_by_staleness_with_primary(servers, primary, max_staleness),
            None => self.filter_by_staleness_without_primary(servers, max_staleness),
        };
    }

    fn filter_by_staleness_with_primary(
        &self,
        servers: &mut Vec<&ServerDescription>,
        primary: &ServerDescription,
        max_staleness: Duration,
    ) {
        let heartbeat_frequency = self.heartbeat_frequency();

        servers.retain(|description| {
            let server_staleness =
                calculate_secondary_staleness_with_primary(description, primary);
            server_staleness
                .map(|staleness| staleness + heartbeat_frequency <= max_staleness)
                .unwrap_or(false)
        });
    }

    fn filter_by_staleness_without_primary(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let heartbeat_frequency = self.heartbeat_frequency();
        let max_write_date = self
            .servers
            .values()
            .filter(|description| description.server_type == ServerType::RsSecondary)
            .filter_map(|description| description.last_write_date())
            .map(|date| date.timestamp_millis())
            .max();
        let max_write_date = match max_write_date {
            Some(date) => date,
            None => return,
        };

        servers.retain(|description| match description.last_write_date() {
            Some(write_date) => {
                let staleness_ms = (max_write_date - write_date.timestamp_millis()).max(0) as u64;
                Duration::from_millis(staleness_ms) + heartbeat_frequency <= max_staleness
            }
            None => false,
        });
    }

    fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq
            .unwrap_or(crate::sdam::monitor::DEFAULT_HEARTBEAT_FREQUENCY)
    }
}

fn calculate_secondary_staleness_with_primary(
    secondary: &ServerDescription,
    primary: &ServerDescription,
) -> Option<Duration> {
    let primary_last_update = primary.last_update_time.timestamp_millis();
    let primary_last_write = primary.last_write_date()?.timestamp_millis();
    let secondary_last_update = secondary.last_update_time.timestamp_millis();
    let secondary_last_write = secondary.last_write_date()?.timestamp_millis();

    let staleness_ms = (secondary_last_update - secondary_last_write)
        - (primary_last_update - primary_last_write);
    Some(Duration::from_millis(staleness_ms.max(0) as u64))
}

fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        let matching_servers: Vec<_> = servers
            .iter()
            .filter(|description| description.matches_tag_set(tag_set))
            .copied()
            .collect();
        if !matching_servers.is_empty() {
            *servers = matching_servers;
            return;
        }
    }

    servers.clear();
}

fn verify_max_staleness(max_staleness: Duration, heartbeat_frequency: Duration) -> Result<()> {
    if max_staleness < Duration::from_secs(90).max(heartbeat_frequency + IDLE_WRITE_PERIOD) {
        return Err(Error::invalid_argument(
            "max staleness must be at least 90 seconds and at least heartbeatFrequencyMS + 10 \
             seconds",
        ));
    }
    Ok(())
}
