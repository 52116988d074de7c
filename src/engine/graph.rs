//! Plot dependency graph.
//!
//! Built from the finalized links in the store. Every traversal the engine
//! needs (upstream lookup, downstream cascade, connected components, loop
//! detection) goes through this one type.

use crate::store::{Entity, EntityId, Link};
use std::collections::{BTreeSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    link: EntityId,
    upstream: EntityId,
    downstream: EntityId,
}

/// Why a finalized link is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkViolation {
    /// An endpoint is unset or names a missing plot.
    DanglingEndpoint,
    /// Upstream and downstream are the same plot.
    SelfLoop,
    /// An older link already connects the same two plots.
    Duplicate(EntityId),
    /// The link would close a cycle.
    EndlessLoop,
}

impl std::fmt::Display for LinkViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DanglingEndpoint => f.write_str("dangling endpoint"),
            Self::SelfLoop => f.write_str("self loop"),
            Self::Duplicate(other) => write!(f, "duplicate of link {other}"),
            Self::EndlessLoop => f.write_str("endless loop"),
        }
    }
}

/// Directed plot graph over finalized links.
#[derive(Debug, Clone, Default)]
pub struct PlotGraph {
    edges: Vec<Edge>,
}

impl PlotGraph {
    /// Build the graph from every finalized link with two set endpoints.
    pub fn from_links<'a>(links: impl IntoIterator<Item = &'a Link>) -> Self {
        let edges = links
            .into_iter()
            .filter(|link| link.is_finalized() && link.upstream() > 0 && link.downstream() > 0)
            .map(|link| Edge {
                link: link.id(),
                upstream: link.upstream(),
                downstream: link.downstream(),
            })
            .collect();
        Self { edges }
    }

    /// Number of edges.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Direct upstream plots, ascending.
    pub fn upstreams(&self, plot: EntityId) -> Vec<EntityId> {
        let set: BTreeSet<_> = self
            .edges
            .iter()
            .filter(|e| e.downstream == plot)
            .map(|e| e.upstream)
            .collect();
        set.into_iter().collect()
    }

    /// Direct downstream plots, ascending.
    pub fn downstreams(&self, plot: EntityId) -> Vec<EntityId> {
        let set: BTreeSet<_> = self
            .edges
            .iter()
            .filter(|e| e.upstream == plot)
            .map(|e| e.downstream)
            .collect();
        set.into_iter().collect()
    }

    /// Every plot reachable downstream of `roots`, including the roots.
    pub fn with_descendants(&self, roots: impl IntoIterator<Item = EntityId>) -> BTreeSet<EntityId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<EntityId> = roots.into_iter().collect();
        while let Some(plot) = queue.pop_front() {
            if seen.insert(plot) {
                queue.extend(self.downstreams(plot));
            }
        }
        seen
    }

    /// Breadth-first collection of every plot connected to `start`, ignoring
    /// link direction. Always contains `start`.
    pub fn connected_plots(&self, start: EntityId) -> BTreeSet<EntityId> {
        let mut seen = BTreeSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(plot) = queue.pop_front() {
            for edge in &self.edges {
                let next = if edge.upstream == plot {
                    edge.downstream
                } else if edge.downstream == plot {
                    edge.upstream
                } else {
                    continue;
                };
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Connected components over `plots`, each sorted, ordered by smallest
    /// member.
    pub fn components(&self, plots: impl IntoIterator<Item = EntityId>) -> Vec<BTreeSet<EntityId>> {
        let mut assigned = BTreeSet::new();
        let mut components = Vec::new();
        let all: BTreeSet<EntityId> = plots.into_iter().collect();
        for plot in &all {
            if assigned.contains(plot) {
                continue;
            }
            let component: BTreeSet<EntityId> = self
                .connected_plots(*plot)
                .into_iter()
                .filter(|p| all.contains(p))
                .collect();
            assigned.extend(component.iter().copied());
            components.push(component);
        }
        components
    }

    /// Links whose endpoints both lie in `plots`.
    pub fn links_within(&self, plots: &BTreeSet<EntityId>) -> Vec<EntityId> {
        self.edges
            .iter()
            .filter(|e| plots.contains(&e.upstream) && plots.contains(&e.downstream))
            .map(|e| e.link)
            .collect()
    }

    /// Whether adding `upstream -> downstream` would close a cycle, i.e.
    /// `upstream` is already reachable downstream of `downstream`. Edges of
    /// the link being checked are ignored.
    pub fn is_endless_loop(&self, link: EntityId, upstream: EntityId, downstream: EntityId) -> bool {
        if upstream == downstream {
            return true;
        }
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([downstream]);
        while let Some(plot) = queue.pop_front() {
            if plot == upstream {
                return true;
            }
            if !seen.insert(plot) {
                continue;
            }
            queue.extend(
                self.edges
                    .iter()
                    .filter(|e| e.link != link && e.upstream == plot)
                    .map(|e| e.downstream),
            );
        }
        false
    }

    /// Check a finalized link against the graph. `plot_exists` says whether
    /// a plot id is live.
    pub fn validate(&self, link: &Link, plot_exists: impl Fn(EntityId) -> bool) -> Result<(), LinkViolation> {
        let id = link.id();
        let (up, down) = (link.upstream(), link.downstream());
        if !plot_exists(up) || !plot_exists(down) {
            return Err(LinkViolation::DanglingEndpoint);
        }
        if up == down {
            return Err(LinkViolation::SelfLoop);
        }
        if let Some(other) = self
            .edges
            .iter()
            .find(|e| e.link != id && e.upstream == up && e.downstream == down)
        {
            return Err(LinkViolation::Duplicate(other.link));
        }
        if self.is_endless_loop(id, up, down) {
            return Err(LinkViolation::EndlessLoop);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(id: EntityId, up: EntityId, down: EntityId) -> Link {
        let mut link = Link::new_with_id(id);
        link.set_upstream(up);
        link.set_downstream(down);
        link
    }

    #[test]
    fn test_up_and_downstreams() {
        let links = [link(1, 10, 11), link(2, 11, 12), link(3, 10, 12)];
        let graph = PlotGraph::from_links(&links);
        assert_eq!(graph.upstreams(12), vec![10, 11]);
        assert_eq!(graph.downstreams(10), vec![11, 12]);
        assert_eq!(graph.with_descendants([11]), BTreeSet::from([11, 12]));
    }

    #[test]
    fn test_unfinalized_links_ignored() {
        let mut pending = link(1, 10, 11);
        pending.set_created_by(5);
        let graph = PlotGraph::from_links([&pending, &link(2, 20, -1)]);
        assert!(graph.is_empty());
    }

    #[test]
    fn test_components_ignore_direction() {
        let links = [link(1, 1, 2), link(2, 3, 2), link(3, 4, 5)];
        let graph = PlotGraph::from_links(&links);
        let components = graph.components([1, 2, 3, 4, 5, 6]);
        assert_eq!(
            components,
            vec![
                BTreeSet::from([1, 2, 3]),
                BTreeSet::from([4, 5]),
                BTreeSet::from([6]),
            ]
        );
        assert_eq!(graph.links_within(&components[0]), vec![1, 2]);
    }

    #[test]
    fn test_validate_rejects_loops_and_duplicates() {
        let links = [link(1, 1, 2), link(2, 2, 3)];
        let graph = PlotGraph::from_links(&links);
        let exists = |id: EntityId| (1..=3).contains(&id);

        assert_eq!(graph.validate(&links[0], exists), Ok(()));
        assert_eq!(graph.validate(&link(3, 3, 1), exists), Err(LinkViolation::EndlessLoop));
        assert_eq!(graph.validate(&link(4, 2, 2), exists), Err(LinkViolation::SelfLoop));
        assert_eq!(graph.validate(&link(5, 1, 2), exists), Err(LinkViolation::Duplicate(1)));
        assert_eq!(graph.validate(&link(6, 1, 9), exists), Err(LinkViolation::DanglingEndpoint));
    }

    #[test]
    fn test_duplicate_found_in_either_direction_of_age() {
        let links = [link(1, 1, 2), link(2, 1, 2)];
        let graph = PlotGraph::from_links(&links);
        let exists = |id: EntityId| (1..=2).contains(&id);

        assert_eq!(graph.validate(&links[0], exists), Err(LinkViolation::Duplicate(2)));
        assert_eq!(graph.validate(&links[1], exists), Err(LinkViolation::Duplicate(1)));
    }
}
