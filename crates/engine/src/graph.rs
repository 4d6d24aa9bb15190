//! Dependency graph of a flow's steps.
//!
//! Step A precedes step B when B's mapping reads a table A's mapping writes,
//! or when B declares A in `depends_on`. Nodes are indices into the step
//! list sorted by id, so every traversal is deterministic.

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use crate::error::DefinitionError;

/// Tables a step reads and writes, plus its explicit dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepIo {
    pub step_id: String,
    pub reads: Vec<String>,
    pub writes: Vec<String>,
    pub depends_on: Vec<String>,
}

impl StepIo {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            reads: Vec::new(),
            writes: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn reads(mut self, table: &str) -> Self {
        self.reads.push(table.to_string());
        self
    }

    pub fn writes(mut self, table: &str) -> Self {
        self.writes.push(table.to_string());
        self
    }

    pub fn after(mut self, step: &str) -> Self {
        self.depends_on.push(step.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    flow_id: String,
    ids: Vec<String>,
    index: HashMap<String, usize>,
    successors: Vec<BTreeSet<usize>>,
    predecessors: Vec<BTreeSet<usize>>,
    /// Table → producing steps.
    write_index: BTreeMap<String, Vec<usize>>,
}

impl DependencyGraph {
    /// Build the graph. Fails on a dependency outside the flow.
    pub fn build(flow_id: &str, steps: &[StepIo]) -> Result<Self, DefinitionError> {
        let mut sorted: Vec<&StepIo> = steps.iter().collect();
        sorted.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        sorted.dedup_by(|a, b| a.step_id == b.step_id);

        let ids: Vec<String> = sorted.iter().map(|s| s.step_id.clone()).collect();
        let index: HashMap<String, usize> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut write_index: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut read_index: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, step) in sorted.iter().enumerate() {
            for table in &step.writes {
                write_index.entry(table.clone()).or_default().push(i);
            }
            for table in &step.reads {
                read_index.entry(table.clone()).or_default().push(i);
            }
        }

        let n = ids.len();
        let mut graph = Self {
            flow_id: flow_id.to_string(),
            ids,
            index,
            successors: vec![BTreeSet::new(); n],
            predecessors: vec![BTreeSet::new(); n],
            write_index,
        };

        for (table, readers) in &read_index {
            let Some(writers) = graph.write_index.get(table).cloned() else {
                continue;
            };
            for &writer in &writers {
                for &reader in readers {
                    if writer != reader {
                        graph.add_edge(writer, reader);
                    }
                }
            }
        }

        for (i, step) in sorted.iter().enumerate() {
            for dependency in &step.depends_on {
                let Some(&upstream) = graph.index.get(dependency) else {
                    return Err(DefinitionError::UnknownDependency {
                        flow: flow_id.to_string(),
                        step: step.step_id.clone(),
                        dependency: dependency.clone(),
                    });
                };
                graph.add_edge(upstream, i);
            }
        }

        Ok(graph)
    }

    fn add_edge(&mut self, from: usize, to: usize) {
        self.successors[from].insert(to);
        self.predecessors[to].insert(from);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => self.successors[a].contains(&b),
            _ => false,
        }
    }

    /// Edges as `(from, to)` step ids.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.successors.iter().enumerate().flat_map(move |(from, tos)| {
            tos.iter()
                .map(move |&to| (self.ids[from].as_str(), self.ids[to].as_str()))
        })
    }

    /// Steps writing `table`, in id order.
    pub fn writers(&self, table: &str) -> Vec<&str> {
        self.write_index
            .get(table)
            .map(|w| w.iter().map(|&i| self.ids[i].as_str()).collect())
            .unwrap_or_default()
    }

    /// Tables written by more than one step.
    pub fn shared_targets(&self) -> impl Iterator<Item = (&str, Vec<&str>)> {
        self.write_index
            .iter()
            .filter(|(_, writers)| writers.len() > 1)
            .map(|(table, writers)| {
                (
                    table.as_str(),
                    writers.iter().map(|&i| self.ids[i].as_str()).collect(),
                )
            })
    }

    /// First cycle found by depth-first search, as a closed path
    /// (`[a, b, a]`).
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let n = self.ids.len();
        let mut color = vec![Color::White; n];
        let mut path: Vec<usize> = Vec::new();

        for root in 0..n {
            if color[root] != Color::White {
                continue;
            }
            // Explicit stack of (node, remaining successors).
            let mut stack: Vec<(usize, Vec<usize>)> = Vec::new();
            color[root] = Color::Gray;
            path.push(root);
            stack.push((root, self.successors[root].iter().rev().copied().collect()));

            while let Some((node, pending)) = stack.last_mut() {
                let node = *node;
                match pending.pop() {
                    Some(next) => match color[next] {
                        Color::White => {
                            color[next] = Color::Gray;
                            path.push(next);
                            stack.push((next, self.successors[next].iter().rev().copied().collect()));
                        }
                        Color::Gray => {
                            let start = path.iter().position(|&p| p == next).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                path[start..].iter().map(|&i| self.ids[i].clone()).collect();
                            cycle.push(self.ids[next].clone());
                            return Some(cycle);
                        }
                        Color::Black => {}
                    },
                    None => {
                        color[node] = Color::Black;
                        path.pop();
                        stack.pop();
                    }
                }
            }
        }

        None
    }

    /// Check for cycles and produce the execution plan.
    pub fn plan(&self) -> Result<ExecutionPlan, DefinitionError> {
        if let Some(steps) = self.find_cycle() {
            return Err(DefinitionError::CyclicFlow {
                flow: self.flow_id.clone(),
                steps,
            });
        }

        let n = self.ids.len();

        // Kahn's algorithm; the min-heap breaks ties by step id.
        let mut in_degree: Vec<usize> = self.predecessors.iter().map(BTreeSet::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&i| in_degree[i] == 0)
            .map(Reverse)
            .collect();
        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for &next in &self.successors[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        // Longest-path layering.
        let mut depth = vec![0usize; n];
        for &node in &order {
            for &next in &self.successors[node] {
                depth[next] = depth[next].max(depth[node] + 1);
            }
        }
        let layer_count = depth.iter().max().map_or(0, |d| d + 1);
        let mut layers = vec![Vec::new(); layer_count];
        for &node in &order {
            layers[depth[node]].push(self.ids[node].clone());
        }
        for layer in &mut layers {
            layer.sort();
        }

        // Descendants, filled in reverse topological order.
        let mut descendants: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        for &node in order.iter().rev() {
            let mut reach = BTreeSet::new();
            for &next in &self.successors[node] {
                reach.insert(next);
                reach.extend(descendants[next].iter().copied());
            }
            descendants[node] = reach;
        }

        let name = |set: &BTreeSet<usize>| -> BTreeSet<String> {
            set.iter().map(|&i| self.ids[i].clone()).collect()
        };

        Ok(ExecutionPlan {
            flow_id: self.flow_id.clone(),
            order: order.iter().map(|&i| self.ids[i].clone()).collect(),
            layers,
            predecessors: (0..n)
                .map(|i| (self.ids[i].clone(), name(&self.predecessors[i])))
                .collect(),
            descendants: (0..n)
                .map(|i| (self.ids[i].clone(), name(&descendants[i])))
                .collect(),
        })
    }
}

/// Topologically ordered plan for one flow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub flow_id: String,
    /// Every step, predecessors first, ties broken by id.
    pub order: Vec<String>,
    /// Longest-path layers. No path connects two members of one layer.
    pub layers: Vec<Vec<String>>,
    /// Direct predecessors of each step.
    pub predecessors: BTreeMap<String, BTreeSet<String>>,
    #[serde(skip)]
    descendants: BTreeMap<String, BTreeSet<String>>,
}

impl ExecutionPlan {
    pub fn predecessors_of(&self, step_id: &str) -> impl Iterator<Item = &str> {
        self.predecessors
            .get(step_id)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Whether `to` is reachable from `from`.
    pub fn depends_on(&self, to: &str, from: &str) -> bool {
        self.descendants
            .get(from)
            .is_some_and(|reach| reach.contains(to))
    }

    /// True when no path connects the two steps.
    pub fn may_run_in_parallel(&self, a: &str, b: &str) -> bool {
        a != b && !self.depends_on(a, b) && !self.depends_on(b, a)
    }

    pub fn position(&self, step_id: &str) -> Option<usize> {
        self.order.iter().position(|s| s == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scenario() -> Vec<StepIo> {
        vec![
            StepIo::new("S1").reads("raw").writes("stage"),
            StepIo::new("S2").reads("stage").writes("mart"),
            StepIo::new("S3").reads("events").writes("log"),
        ]
    }

    #[test]
    fn test_inferred_edges_and_parallel_groups() {
        let graph = DependencyGraph::build("nightly", &scenario()).unwrap();
        assert!(graph.has_edge("S1", "S2"));
        assert!(!graph.has_edge("S1", "S3"));

        let plan = graph.plan().unwrap();
        assert!(plan.position("S1") < plan.position("S2"));
        assert!(plan.may_run_in_parallel("S1", "S3"));
        assert!(plan.may_run_in_parallel("S2", "S3"));
        assert!(!plan.may_run_in_parallel("S1", "S2"));
        assert_eq!(plan.layers, vec![vec!["S1", "S3"], vec!["S2"]]);
        assert_eq!(plan.predecessors_of("S2").collect::<Vec<_>>(), vec!["S1"]);
    }

    #[test]
    fn test_explicit_dependency_unioned() {
        let mut steps = scenario();
        steps[2].depends_on.push("S2".into());
        let plan = DependencyGraph::build("nightly", &steps).unwrap().plan().unwrap();
        assert_eq!(plan.order, vec!["S1", "S2", "S3"]);
        assert!(plan.depends_on("S3", "S1"));
    }

    #[test]
    fn test_unknown_dependency() {
        let steps = vec![StepIo::new("a").after("ghost")];
        let err = DependencyGraph::build("f", &steps).unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownDependency { ref dependency, .. } if dependency == "ghost"));
    }

    #[test]
    fn test_cycle_names_every_step() {
        let steps = vec![
            StepIo::new("a").reads("t3").writes("t1"),
            StepIo::new("b").reads("t1").writes("t2"),
            StepIo::new("c").reads("t2").writes("t3"),
            StepIo::new("d").reads("t3").writes("t4"),
        ];
        let err = DependencyGraph::build("loop", &steps).unwrap().plan().unwrap_err();
        match err {
            DefinitionError::CyclicFlow { flow, steps } => {
                assert_eq!(flow, "loop");
                assert_eq!(steps, vec!["a", "b", "c", "a"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let steps = vec![StepIo::new("a").after("a")];
        let err = DependencyGraph::build("f", &steps).unwrap().plan().unwrap_err();
        assert!(matches!(err, DefinitionError::CyclicFlow { ref steps, .. } if steps == &["a", "a"]));
    }

    #[test]
    fn test_multiple_writers_feed_every_reader() {
        let steps = vec![
            StepIo::new("w1").writes("t"),
            StepIo::new("w2").writes("t"),
            StepIo::new("r").reads("t"),
        ];
        let graph = DependencyGraph::build("f", &steps).unwrap();
        assert!(graph.has_edge("w1", "r"));
        assert!(graph.has_edge("w2", "r"));
        assert_eq!(graph.writers("t"), vec!["w1", "w2"]);
        assert_eq!(graph.shared_targets().count(), 1);
    }

    #[test]
    fn test_empty_flow() {
        let plan = DependencyGraph::build("f", &[]).unwrap().plan().unwrap();
        assert!(plan.order.is_empty());
        assert!(plan.layers.is_empty());
    }

    // Edges only go from lower to higher index, so the graph is acyclic.
    fn acyclic_steps() -> impl Strategy<Value = Vec<StepIo>> {
        (2usize..8).prop_flat_map(|n| {
            prop::collection::vec(prop::collection::vec(any::<bool>(), n), n).prop_map(move |m| {
                (0..n)
                    .map(|i| {
                        let mut step = StepIo::new(format!("s{i}")).writes(&format!("t{i}"));
                        for j in 0..i {
                            if m[i][j] {
                                step = if (i + j) % 2 == 0 {
                                    step.reads(&format!("t{j}"))
                                } else {
                                    step.after(&format!("s{j}"))
                                };
                            }
                        }
                        step
                    })
                    .collect()
            })
        })
    }

    proptest! {
        #[test]
        fn plan_respects_every_edge(steps in acyclic_steps()) {
            let graph = DependencyGraph::build("p", &steps).unwrap();
            let plan = graph.plan().unwrap();
            prop_assert_eq!(plan.order.len(), steps.len());
            for (from, to) in graph.edges() {
                prop_assert!(plan.position(from) < plan.position(to));
                prop_assert!(!plan.may_run_in_parallel(from, to));
            }
            for layer in &plan.layers {
                for a in layer {
                    for b in layer {
                        if a != b {
                            prop_assert!(plan.may_run_in_parallel(a, b));
                        }
                    }
                }
            }
        }

        #[test]
        fn back_edge_is_reported_as_cycle(steps in acyclic_steps()) {
            let mut steps = steps;
            let last = steps.len() - 1;
            // s0 -> ... chain closes through an explicit dependency.
            steps[last].depends_on.push("s0".into());
            steps[0].depends_on.push(format!("s{last}"));
            let err = DependencyGraph::build("p", &steps).unwrap().plan().unwrap_err();
            match err {
                DefinitionError::CyclicFlow { steps: cycle, .. } => {
                    prop_assert_eq!(cycle.first(), cycle.last());
                    prop_assert!(cycle.len() >= 3);
                }
                other => prop_assert!(false, "unexpected error: {:?}", other),
            }
        }
    }
}
