// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Directed routing graph over waypoints.
//!
//! Each edge `src -> dst` is annotated with the set of query exits that
//! flow along it. The graph is immutable once built and answers two
//! queries:
//!
//! - forward: given a source and a destination query-exit set, partition
//!   the destinations by the next-hop waypoint they travel through
//!   (subsets are disjoint because a query exit flows along exactly one
//!   out-edge of any waypoint);
//! - backward: given a source and one destination query exit, list the
//!   direct upstream predecessors relevant to it.

use std::collections::{BTreeMap, HashMap};

use super::message::{QueryExit, QueryExitSet, WaypointId};

/// Builder for [`RoutingGraph`]; collects annotated edges.
#[derive(Debug, Default)]
pub struct RoutingGraphBuilder {
    edges: Vec<(WaypointId, WaypointId, QueryExitSet)>,
}

impl RoutingGraphBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge `src -> dst` carrying `exits`.
    #[must_use]
    pub fn edge(
        mut self,
        src: WaypointId,
        dst: WaypointId,
        exits: impl IntoIterator<Item = QueryExit>,
    ) -> Self {
        self.edges.push((src, dst, exits.into_iter().collect()));
        self
    }

    /// Freeze the graph.
    #[must_use]
    pub fn build(self) -> RoutingGraph {
        let mut out_edges: HashMap<WaypointId, Vec<(WaypointId, QueryExitSet)>> = HashMap::new();
        let mut in_edges: HashMap<WaypointId, Vec<(WaypointId, QueryExitSet)>> = HashMap::new();

        for (src, dst, exits) in self.edges {
            // A query exit leaves a waypoint along exactly one edge;
            // overlapping annotations would make routing ambiguous.
            if let Some(existing) = out_edges.get(&src) {
                for (_, annotated) in existing {
                    debug_assert!(
                        annotated.is_disjoint(&exits),
                        "query exits on the out-edges of {src} overlap"
                    );
                }
            }
            out_edges.entry(src).or_default().push((dst, exits.clone()));
            in_edges.entry(dst).or_default().push((src, exits));
        }

        RoutingGraph { out_edges, in_edges }
    }
}

/// Immutable routing graph; see the module docs for the two queries.
#[derive(Debug, Default)]
pub struct RoutingGraph {
    out_edges: HashMap<WaypointId, Vec<(WaypointId, QueryExitSet)>>,
    in_edges: HashMap<WaypointId, Vec<(WaypointId, QueryExitSet)>>,
}

impl RoutingGraph {
    /// Partition `dests` by the next hop out of `src`. Query exits no
    /// out-edge covers are silently dropped from the result; the caller
    /// decides whether an empty result is worth a warning.
    #[must_use]
    pub fn find_all_routings(
        &self,
        src: WaypointId,
        dests: &QueryExitSet,
    ) -> BTreeMap<WaypointId, QueryExitSet> {
        let mut routings = BTreeMap::new();
        let Some(edges) = self.out_edges.get(&src) else {
            return routings;
        };

        for (next_hop, annotated) in edges {
            let subset: QueryExitSet = annotated.intersection(dests).copied().collect();
            if !subset.is_empty() {
                routings
                    .entry(*next_hop)
                    .or_insert_with(QueryExitSet::new)
                    .extend(subset);
            }
        }
        routings
    }

    /// Direct predecessors of `src` whose edge annotation includes
    /// `dest`.
    #[must_use]
    pub fn find_upstream_waypoints(&self, src: WaypointId, dest: QueryExit) -> Vec<WaypointId> {
        let Some(edges) = self.in_edges.get(&src) else {
            return Vec::new();
        };
        edges
            .iter()
            .filter(|(_, annotated)| annotated.contains(&dest))
            .map(|(pred, _)| *pred)
            .collect()
    }

    /// Number of edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.out_edges.values().map(Vec::len).sum()
    }
}
