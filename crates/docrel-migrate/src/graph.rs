//! Dependency graph and topological ordering of tables.
//!
//! Every non-self foreign key adds an edge `dependent -> dependency`. Tables
//! are ordered with Kahn's algorithm, seeded in input order so the result is
//! deterministic. Tables left over when no zero in-degree node remains sit
//! on, or behind, a cycle; cycles are reported rather than rejected.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::core::schema::TableDefinition;

/// Tables a table must be written after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDependency {
    pub table_name: String,
    pub depends_on: Vec<String>,
}

impl TableDependency {
    pub fn new<S: Into<String>>(table_name: impl Into<String>, depends_on: impl IntoIterator<Item = S>) -> Self {
        Self {
            table_name: table_name.into(),
            depends_on: depends_on.into_iter().map(Into::into).collect(),
        }
    }
}

/// Result of [`topological_sort`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortResult {
    /// Acyclic tables in a foreign-key-safe order.
    pub order: Vec<String>,

    /// Residual tables grouped by the cycle they sit on or behind.
    pub cycles: Vec<Vec<String>>,

    /// Tables with no dependencies.
    pub independent: Vec<String>,
}

impl SortResult {
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }
}

/// Derive dependencies from foreign keys, skipping self-references.
pub fn build_dependencies(tables: &[TableDefinition]) -> Vec<TableDependency> {
    tables
        .iter()
        .map(|table| {
            let mut depends_on: Vec<String> = Vec::new();
            for fk in table.external_foreign_keys() {
                if !depends_on.contains(&fk.referenced_table) {
                    depends_on.push(fk.referenced_table.clone());
                }
            }
            TableDependency {
                table_name: table.name.clone(),
                depends_on,
            }
        })
        .collect()
}

/// Indexed adjacency for a dependency list.
///
/// Edges to tables outside the list and self-edges are ignored.
struct Graph<'a> {
    names: Vec<&'a str>,
    /// `deps[i]`: indices `i` depends on.
    deps: Vec<Vec<usize>>,
    /// `dependents[j]`: indices that depend on `j`.
    dependents: Vec<Vec<usize>>,
}

impl<'a> Graph<'a> {
    fn new(dependencies: &'a [TableDependency]) -> Self {
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut names = Vec::new();
        for dep in dependencies {
            if !index.contains_key(dep.table_name.as_str()) {
                index.insert(&dep.table_name, names.len());
                names.push(dep.table_name.as_str());
            }
        }

        let mut deps = vec![Vec::new(); names.len()];
        let mut dependents = vec![Vec::new(); names.len()];
        for dep in dependencies {
            let i = index[dep.table_name.as_str()];
            for target in &dep.depends_on {
                let Some(&j) = index.get(target.as_str()) else {
                    continue;
                };
                if i != j && !deps[i].contains(&j) {
                    deps[i].push(j);
                    dependents[j].push(i);
                }
            }
        }

        Self {
            names,
            deps,
            dependents,
        }
    }

    fn len(&self) -> usize {
        self.names.len()
    }

    fn name(&self, i: usize) -> String {
        self.names[i].to_string()
    }

    /// Kahn's algorithm. Returns the ordered indices and residual in-degrees.
    fn kahn(&self) -> (Vec<usize>, Vec<usize>) {
        let mut remaining: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..self.len()).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &d in &self.dependents[i] {
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    queue.push_back(d);
                }
            }
        }
        (order, remaining)
    }

    /// Elementary cycles found by DFS over residual nodes.
    fn find_cycles(&self, residual: &[bool]) -> Vec<Vec<usize>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Gray,
            Black,
        }

        fn visit(
            graph: &Graph<'_>,
            residual: &[bool],
            node: usize,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
            cycles: &mut Vec<Vec<usize>>,
        ) {
            marks[node] = Mark::Gray;
            stack.push(node);
            for &next in &graph.deps[node] {
                if !residual[next] {
                    continue;
                }
                match marks[next] {
                    Mark::White => visit(graph, residual, next, marks, stack, cycles),
                    Mark::Gray => {
                        if let Some(pos) = stack.iter().position(|&n| n == next) {
                            cycles.push(stack[pos..].to_vec());
                        }
                    }
                    Mark::Black => {}
                }
            }
            stack.pop();
            marks[node] = Mark::Black;
        }

        let mut marks = vec![Mark::White; self.len()];
        let mut cycles = Vec::new();
        for node in 0..self.len() {
            if residual[node] && marks[node] == Mark::White {
                let mut stack = Vec::new();
                visit(self, residual, node, &mut marks, &mut stack, &mut cycles);
            }
        }
        cycles
    }
}

/// Order tables so every table follows the tables it references.
///
/// `order` holds only acyclic tables. Every residual table appears in
/// exactly one `cycles` group: either a detected cycle, or appended to the
/// group of the first cycle it (transitively) depends on.
pub fn topological_sort(dependencies: &[TableDependency]) -> SortResult {
    let graph = Graph::new(dependencies);
    let (order, remaining) = graph.kahn();

    let independent = (0..graph.len())
        .filter(|&i| graph.deps[i].is_empty())
        .map(|i| graph.name(i))
        .collect();

    let residual: Vec<bool> = remaining.iter().map(|&r| r > 0).collect();
    let mut groups = graph.find_cycles(&residual);

    let mut group_of: HashMap<usize, usize> = HashMap::new();
    for (g, cycle) in groups.iter().enumerate() {
        for &n in cycle {
            group_of.entry(n).or_insert(g);
        }
    }

    // Residual nodes that are not on a cycle depend, directly or not, on one.
    for node in (0..graph.len()).filter(|&n| residual[n]) {
        if group_of.contains_key(&node) {
            continue;
        }
        let mut seen = HashSet::from([node]);
        let mut queue = VecDeque::from([node]);
        let mut target = None;
        while let Some(n) = queue.pop_front() {
            if let Some(&g) = group_of.get(&n) {
                target = Some(g);
                break;
            }
            for &d in &graph.deps[n] {
                if residual[d] && seen.insert(d) {
                    queue.push_back(d);
                }
            }
        }
        let g = match target {
            Some(g) => g,
            None => {
                groups.push(Vec::new());
                groups.len() - 1
            }
        };
        groups[g].push(node);
        group_of.insert(node, g);
    }

    SortResult {
        order: order.into_iter().map(|i| graph.name(i)).collect(),
        cycles: groups
            .into_iter()
            .map(|g| g.into_iter().map(|i| graph.name(i)).collect())
            .collect(),
        independent,
    }
}

/// Complete write order: the acyclic order, then residual tables.
///
/// Residual tables are released one at a time, always picking the table with
/// the fewest unsatisfied dependencies (ties by input order), which breaks
/// each cycle at its weakest point.
pub fn write_order(dependencies: &[TableDependency]) -> Vec<String> {
    let graph = Graph::new(dependencies);
    let mut remaining: Vec<usize> = graph.deps.iter().map(Vec::len).collect();
    let mut placed = vec![false; graph.len()];
    let mut order = Vec::with_capacity(graph.len());
    let mut queue: VecDeque<usize> = (0..graph.len()).filter(|&i| remaining[i] == 0).collect();

    loop {
        while let Some(i) = queue.pop_front() {
            if placed[i] {
                continue;
            }
            placed[i] = true;
            order.push(i);
            for &d in &graph.dependents[i] {
                remaining[d] = remaining[d].saturating_sub(1);
                if remaining[d] == 0 && !placed[d] {
                    queue.push_back(d);
                }
            }
        }

        let forced = (0..graph.len())
            .filter(|&i| !placed[i])
            .min_by_key(|&i| (remaining[i], i));
        match forced {
            Some(i) => queue.push_back(i),
            None => break,
        }
    }

    order.into_iter().map(|i| graph.name(i)).collect()
}

/// Bucket acyclic tables into waves: wave `k` depends only on waves `< k`.
///
/// Tables on or behind a cycle belong to no wave.
pub fn group_by_dependency_level(dependencies: &[TableDependency]) -> Vec<Vec<String>> {
    let graph = Graph::new(dependencies);
    let (order, _) = graph.kahn();

    let mut level = vec![0usize; graph.len()];
    for &i in &order {
        level[i] = graph.deps[i]
            .iter()
            .map(|&d| level[d] + 1)
            .max()
            .unwrap_or(0);
    }

    let mut in_order = vec![false; graph.len()];
    for &i in &order {
        in_order[i] = true;
    }

    let depth = order.iter().map(|&i| level[i] + 1).max().unwrap_or(0);
    let mut waves = vec![Vec::new(); depth];
    for i in (0..graph.len()).filter(|&i| in_order[i]) {
        waves[level[i]].push(graph.name(i));
    }
    waves
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{ColumnDef, ColumnType, ForeignKeyDef};

    fn deps(edges: &[(&str, &[&str])]) -> Vec<TableDependency> {
        edges
            .iter()
            .map(|(t, d)| TableDependency::new(*t, d.iter().copied()))
            .collect()
    }

    fn assert_sound(dependencies: &[TableDependency], order: &[String]) {
        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        for dep in dependencies {
            let Some(&p) = position.get(dep.table_name.as_str()) else {
                continue;
            };
            for target in &dep.depends_on {
                if let Some(&q) = position.get(target.as_str()) {
                    assert!(q < p, "{} must come before {}", target, dep.table_name);
                }
            }
        }
    }

    #[test]
    fn test_chain() {
        let d = deps(&[("A", &[]), ("B", &["A"]), ("C", &["B"])]);
        let result = topological_sort(&d);
        assert_eq!(result.order, vec!["A", "B", "C"]);
        assert_eq!(result.independent, vec!["A"]);
        assert!(result.cycles.is_empty());
    }

    #[test]
    fn test_chain_declared_backwards() {
        let d = deps(&[("C", &["B"]), ("B", &["A"]), ("A", &[])]);
        let result = topological_sort(&d);
        assert_eq!(result.order, vec!["A", "B", "C"]);
        assert_sound(&d, &result.order);
    }

    #[test]
    fn test_two_cycle() {
        let d = deps(&[("A", &["B"]), ("B", &["A"])]);
        let result = topological_sort(&d);
        assert!(result.order.is_empty());
        assert_eq!(result.cycles.len(), 1);
        let mut cycle = result.cycles[0].clone();
        cycle.sort();
        assert_eq!(cycle, vec!["A", "B"]);
        assert!(result.independent.is_empty());
    }

    #[test]
    fn test_cycle_completeness() {
        // D is blocked behind the A/B cycle, E is independent, F depends on E.
        let d = deps(&[
            ("A", &["B"]),
            ("B", &["A"]),
            ("D", &["A"]),
            ("E", &[]),
            ("F", &["E"]),
        ]);
        let result = topological_sort(&d);
        assert_eq!(result.order, vec!["E", "F"]);

        let mut residual: Vec<&str> = result
            .cycles
            .iter()
            .flatten()
            .map(String::as_str)
            .collect();
        residual.sort();
        assert_eq!(residual, vec!["A", "B", "D"]);
        assert_eq!(result.order.len() + residual.len(), d.len());
    }

    #[test]
    fn test_self_and_unknown_edges_ignored() {
        let d = deps(&[("A", &["A", "external"]), ("B", &["A"])]);
        let result = topological_sort(&d);
        assert_eq!(result.order, vec!["A", "B"]);
        assert_eq!(result.independent, vec!["A"]);
    }

    #[test]
    fn test_write_order_places_cycles_last() {
        let d = deps(&[
            ("A", &["B"]),
            ("B", &["A"]),
            ("C", &["A"]),
            ("R", &[]),
        ]);
        let order = write_order(&d);
        assert_eq!(order, vec!["R", "A", "B", "C"]);
    }

    #[test]
    fn test_write_order_is_sound_without_cycles() {
        let d = deps(&[
            ("orders", &["users", "products"]),
            ("users", &[]),
            ("order_lines", &["orders", "products"]),
            ("products", &[]),
        ]);
        let order = write_order(&d);
        assert_eq!(order.len(), 4);
        assert_sound(&d, &order);
    }

    #[test]
    fn test_waves() {
        let d = deps(&[
            ("users", &[]),
            ("products", &[]),
            ("orders", &["users"]),
            ("order_lines", &["orders", "products"]),
            ("x", &["y"]),
            ("y", &["x"]),
        ]);
        let waves = group_by_dependency_level(&d);
        assert_eq!(
            waves,
            vec![
                vec!["users".to_string(), "products".to_string()],
                vec!["orders".to_string()],
                vec!["order_lines".to_string()],
            ]
        );
    }

    #[test]
    fn test_build_dependencies_from_foreign_keys() {
        let users = TableDefinition::new("users", ColumnDef::synthetic_key("id"));
        let mut orders = TableDefinition::new("orders", ColumnDef::synthetic_key("id"));
        orders.push_column(ColumnDef::new("users_id", ColumnType::Integer));
        orders.push_column(ColumnDef::new("buyer_id", ColumnType::Integer));
        orders.push_column(ColumnDef::new("parent_id", ColumnType::Integer));
        orders.foreign_keys = vec![
            ForeignKeyDef::new("users_id", "users", "id"),
            ForeignKeyDef::new("buyer_id", "users", "id"),
            ForeignKeyDef::new("parent_id", "orders", "id"),
        ];

        let d = build_dependencies(&[users, orders]);
        assert_eq!(d[0].depends_on, Vec::<String>::new());
        assert_eq!(d[1].depends_on, vec!["users"]);
    }
}
