//! Best-fit bin packing of containers onto agent capacities.
//!
//! Placement is all-or-nothing: every container of a graph must land on
//! some agent in one pass, otherwise nothing is reserved and the graph
//! stays queued. "Best fit" means the smallest free capacity that still
//! dominates the container's demand under the resource partial order.

use flowgraph_protocol::{Key, Resource, Topology};
use std::collections::HashMap;

/// One agent's schedulable free capacity.
#[derive(Debug, Clone)]
pub struct Bin {
    pub key: Key,
    pub resource: Resource,
}

/// Place every container of `topology` onto the given bins.
///
/// On success returns the `container → bin` assignment and debits each
/// bin's capacity in place. On failure the bins are left untouched.
/// Containers are considered in declared (key) order.
pub fn best_fit(topology: &Topology, bins: &mut [Bin]) -> Option<HashMap<Key, Key>> {
    let mut assignment: HashMap<Key, Key> = HashMap::new();

    let mut containers: Vec<_> = topology.containers.values().collect();
    containers.sort_by_key(|c| c.key);

    for container in &containers {
        let mut best: Option<usize> = None;
        for (idx, bin) in bins.iter().enumerate() {
            if !bin.resource.can_accommodate(&container.resource) {
                continue;
            }
            best = match best {
                Some(current) if !bins[current].resource.dominates(&bin.resource) => Some(current),
                _ => Some(idx),
            };
        }
        match best {
            Some(idx) => {
                bins[idx].resource.take(&container.resource);
                assignment.insert(container.key, bins[idx].key);
            }
            None => {
                // Roll back every reservation made so far.
                for container in &containers {
                    if let Some(bin_key) = assignment.get(&container.key) {
                        if let Some(bin) = bins.iter_mut().find(|b| b.key == *bin_key) {
                            bin.resource.give(&container.resource);
                        }
                    }
                }
                return None;
            }
        }
    }
    Some(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgraph_protocol::ContainerSpec;

    fn topology_with_demands(demands: &[(Key, u64, u64)]) -> Topology {
        let mut t = Topology::new(1, -1);
        for (key, cpus, mem) in demands {
            t.containers.insert(
                *key,
                ContainerSpec {
                    key: *key,
                    resource: Resource::new(*cpus, *mem, 0),
                    configs: Default::default(),
                },
            );
        }
        t
    }

    fn bin(key: Key, cpus: u64, mem: u64) -> Bin {
        Bin {
            key,
            resource: Resource::new(cpus, mem, 0),
        }
    }

    #[test]
    fn picks_the_smallest_dominating_bin() {
        let topology = topology_with_demands(&[(0, 1, 100)]);
        let mut bins = vec![bin(10, 8, 10_000), bin(11, 2, 200)];

        let assignment = best_fit(&topology, &mut bins).unwrap();
        assert_eq!(assignment[&0], 11);
        assert_eq!(bins[1].resource.num_cpus, 1);
        // The big bin is untouched.
        assert_eq!(bins[0].resource.num_cpus, 8);
    }

    #[test]
    fn fails_whole_graph_and_rolls_back() {
        let topology = topology_with_demands(&[(0, 2, 100), (1, 4, 100)]);
        let mut bins = vec![bin(10, 3, 1_000)];

        assert!(best_fit(&topology, &mut bins).is_none());
        // The first container's reservation was rolled back.
        assert_eq!(bins[0].resource.num_cpus, 3);
        assert_eq!(bins[0].resource.memory_limit_in_bytes, 1_000);
    }

    #[test]
    fn spreads_when_one_bin_cannot_hold_both() {
        let topology = topology_with_demands(&[(0, 2, 100), (1, 2, 100)]);
        let mut bins = vec![bin(10, 3, 1_000), bin(11, 2, 150)];

        let assignment = best_fit(&topology, &mut bins).unwrap();
        // Best fit sends the first container to the tighter bin, leaving
        // the larger one for the second.
        assert_eq!(assignment[&0], 11);
        assert_eq!(assignment[&1], 10);
    }

    #[test]
    fn no_container_is_placed_twice() {
        let topology = topology_with_demands(&[(0, 1, 10), (1, 1, 10), (2, 1, 10)]);
        let mut bins = vec![bin(10, 2, 100), bin(11, 2, 100)];

        let assignment = best_fit(&topology, &mut bins).unwrap();
        assert_eq!(assignment.len(), 3);
    }
}
