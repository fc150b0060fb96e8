/// 거래 의향 그래프와 순환 탐지
// region:    --- Imports
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
// endregion: --- Imports

/// 순환 거래 후보. members[0] 이 가장 작은 id 가 되도록 회전되어 있다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeLoop {
    pub members: Vec<i64>,
}

/// 간선 a -> b: a 가 b 의 상품을 원한다.
#[derive(Debug, Default)]
pub struct TradeGraph {
    adjacency: BTreeMap<i64, BTreeSet<i64>>,
}

impl TradeGraph {
    pub fn from_edges<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = (i64, i64)>,
    {
        let mut adjacency: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
        for (from, to) in edges {
            if from == to {
                continue;
            }
            adjacency.entry(from).or_default().insert(to);
            adjacency.entry(to).or_default();
        }
        Self { adjacency }
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    /// 길이 min_len..=max_len 의 기본 순환(elementary cycle)을 모두 찾는다.
    /// 시작 노드보다 큰 노드만 방문하므로 각 순환은 한 번만 보고된다.
    pub fn find_cycles(&self, min_len: usize, max_len: usize) -> Vec<TradeLoop> {
        let mut cycles = Vec::new();
        let mut path = Vec::with_capacity(max_len);
        let mut on_stack = BTreeSet::new();

        for &start in self.adjacency.keys() {
            path.push(start);
            on_stack.insert(start);
            self.search(start, start, min_len, max_len, &mut path, &mut on_stack, &mut cycles);
            on_stack.remove(&start);
            path.pop();
        }
        cycles
    }

    #[allow(clippy::too_many_arguments)]
    fn search(
        &self,
        start: i64,
        current: i64,
        min_len: usize,
        max_len: usize,
        path: &mut Vec<i64>,
        on_stack: &mut BTreeSet<i64>,
        cycles: &mut Vec<TradeLoop>,
    ) {
        let Some(neighbors) = self.adjacency.get(&current) else {
            return;
        };
        for &next in neighbors {
            if next == start {
                if path.len() >= min_len {
                    cycles.push(TradeLoop {
                        members: path.clone(),
                    });
                }
            } else if next > start && !on_stack.contains(&next) && path.len() < max_len {
                path.push(next);
                on_stack.insert(next);
                self.search(start, next, min_len, max_len, path, on_stack, cycles);
                on_stack.remove(&next);
                path.pop();
            }
        }
    }
}
