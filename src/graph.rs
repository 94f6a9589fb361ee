use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

/// Result of a greedy maximal-independent-set pass over an edge list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndependentSet<N> {
    /// Vertices kept, in `tie_break` order.
    pub independent: Vec<N>,
    /// Vertices that had to go, in removal order.
    pub removed: Vec<N>,
}

/// Greedy maximal independent set over the vertices that appear in `edges`.
///
/// Repeatedly removes the vertex of highest remaining degree until no edge
/// is left. Among vertices of equal degree the one that sorts greatest
/// under `tie_break` is removed first, so the outcome depends only on the
/// edge set and the ordering, never on hash iteration order. Removed
/// vertices whose neighbours were all removed later are then re-admitted,
/// latest removal first. Self-loops are ignored.
pub fn maximal_independent_set<N, F>(edges: &[(N, N)], tie_break: F) -> IndependentSet<N>
where
    N: Clone + Eq + Hash,
    F: Fn(&N, &N) -> Ordering,
{
    let mut vertices: Vec<N> = Vec::new();
    let mut index_of: HashMap<N, usize> = HashMap::new();
    for (a, b) in edges {
        for v in [a, b] {
            if !index_of.contains_key(v) {
                index_of.insert(v.clone(), vertices.len());
                vertices.push(v.clone());
            }
        }
    }

    // rank[v] is the position of v in tie-break order; higher rank goes first
    let mut order: Vec<usize> = (0..vertices.len()).collect();
    order.sort_by(|&a, &b| tie_break(&vertices[a], &vertices[b]));
    let mut rank = vec![0usize; vertices.len()];
    for (r, &v) in order.iter().enumerate() {
        rank[v] = r;
    }

    let mut neighbours: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); vertices.len()];
    for (a, b) in edges {
        let (ia, ib) = (index_of[a], index_of[b]);
        if ia == ib {
            continue;
        }
        neighbours[ia].insert(ib);
        neighbours[ib].insert(ia);
    }

    let adjacency = neighbours.clone();
    let mut queue: BTreeSet<(usize, usize, usize)> = BTreeSet::new();
    for (v, adj) in neighbours.iter().enumerate() {
        if !adj.is_empty() {
            queue.insert((adj.len(), rank[v], v));
        }
    }

    let mut is_removed = vec![false; vertices.len()];
    let mut removal_order = Vec::new();
    while let Some((_, _, v)) = queue.pop_last() {
        is_removed[v] = true;
        removal_order.push(v);
        let adj = std::mem::take(&mut neighbours[v]);
        for u in adj {
            let degree = neighbours[u].len();
            queue.remove(&(degree, rank[u], u));
            neighbours[u].remove(&v);
            if degree > 1 {
                queue.insert((degree - 1, rank[u], u));
            }
        }
    }

    // a vertex removed early may have lost every neighbour since; put it back
    for &v in removal_order.iter().rev() {
        if adjacency[v].iter().all(|&u| is_removed[u]) {
            is_removed[v] = false;
        }
    }
    let removed = removal_order
        .into_iter()
        .filter(|&v| is_removed[v])
        .map(|v| vertices[v].clone())
        .collect();

    let independent = order
        .into_iter()
        .filter(|&v| !is_removed[v])
        .map(|v| vertices[v].clone())
        .collect();

    IndependentSet { independent, removed }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lexicographic(a: &String, b: &String) -> Ordering {
        a.cmp(b)
    }

    fn edges(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    }

    #[test]
    fn chain_removes_the_hub() {
        let set = maximal_independent_set(&edges(&[("A", "B"), ("B", "C")]), lexicographic);
        assert_eq!(set.removed, vec!["B".to_string()]);
        assert_eq!(set.independent, vec!["A".to_string(), "C".to_string()]);
    }

    #[test]
    fn ties_remove_the_greatest_id() {
        let set = maximal_independent_set(&edges(&[("S1", "S2")]), lexicographic);
        assert_eq!(set.removed, vec!["S2".to_string()]);
        assert_eq!(set.independent, vec!["S1".to_string()]);
    }

    #[test]
    fn no_edge_survives() {
        let e = edges(&[("A", "B"), ("B", "C"), ("C", "A"), ("C", "D"), ("E", "F"), ("F", "F")]);
        let set = maximal_independent_set(&e, lexicographic);
        for (a, b) in &e {
            if a != b {
                assert!(!(set.independent.contains(a) && set.independent.contains(b)));
            }
        }
        assert_eq!(set.independent.len() + set.removed.len(), 6);
    }

    #[test]
    fn early_removal_is_readmitted_when_all_neighbours_go() {
        let mut pairs = Vec::new();
        for i in 1..=3 {
            let v = format!("v{}", i);
            pairs.push(("z".to_string(), v.clone()));
            pairs.push((v.clone(), format!("a{}", i)));
            pairs.push((v, format!("b{}", i)));
        }
        let set = maximal_independent_set(&pairs, lexicographic);
        assert_eq!(set.removed, vec!["v3".to_string(), "v2".to_string(), "v1".to_string()]);
        assert!(set.independent.contains(&"z".to_string()));
        assert_eq!(set.independent.len(), 7);
        for v in &set.removed {
            assert!(pairs
                .iter()
                .any(|(a, b)| (a == v && set.independent.contains(b)) || (b == v && set.independent.contains(a))));
        }
    }

    #[test]
    fn empty_edges_remove_nothing() {
        let set = maximal_independent_set::<String, _>(&[], lexicographic);
        assert!(set.removed.is_empty());
        assert!(set.independent.is_empty());
    }
}
