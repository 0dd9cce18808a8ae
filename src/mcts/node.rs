//! A single node in an MCTS state-selection tree.
//!
//! Grounded on `objects/mcts_node.py`: nodes are addressed by index into a
//! slab owned by [`crate::mcts::schedule::MctsSchedule`] rather than by
//! `Rc<RefCell<..>>` parent/child links, to keep the tree free of
//! reference cycles (see `objects/fsm.py`'s `TargetStateIdx`-style
//! indexing precedent in the teacher's `state.rs`).

use serde::{Deserialize, Serialize};

/// Index into a [`crate::mcts::schedule::MctsSchedule`]'s node slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MctsNode {
    pub state_path: Vec<String>,
    pub parent: Option<NodeId>,
    pub children: std::collections::HashMap<String, NodeId>,
    pub n_sel: u64,
    /// Reserved for future deterministic-expansion bookkeeping; carried
    /// over from the original's `n_det` field, never consumed beyond
    /// storage.
    pub n_det: u64,
    pub reward: f64,
}

impl MctsNode {
    pub fn root(state_path: Vec<String>) -> Self {
        MctsNode {
            state_path,
            parent: None,
            children: std::collections::HashMap::new(),
            n_sel: 0,
            n_det: 0,
            reward: 0.0,
        }
    }

    pub fn child(state_path: Vec<String>, parent: NodeId) -> Self {
        MctsNode {
            state_path,
            parent: Some(parent),
            children: std::collections::HashMap::new(),
            n_sel: 0,
            n_det: 0,
            reward: 0.0,
        }
    }

    pub fn tail_state(&self) -> &str {
        self.state_path.last().map(|s| s.as_str()).unwrap_or("")
    }

    pub fn has_child(&self, state: &str) -> bool {
        self.children.contains_key(state)
    }

    /// Adds `reward` to the running total and counts this as one more
    /// selection of the node, per spec.md §4.4 ("via `add_reward` (adds to
    /// `reward` and increments `n_sel`)").
    pub fn add_reward(&mut self, reward: f64) {
        self.reward += reward;
        self.n_sel += 1;
    }

    /// `inf` when never selected, else the classic UCT value plus a
    /// caller-supplied novelty bias term (the sink-hit penalty is applied
    /// by the caller on top of this, see [`crate::mcts::schedule`]).
    pub fn uct(&self, parent_n_sel: u64, rho: f64, novelty: f64) -> f64 {
        if self.n_sel == 0 {
            return f64::INFINITY;
        }
        let exploitation = self.reward / self.n_sel as f64;
        let exploration = rho * ((2.0 * (parent_n_sel.max(1) as f64).ln()) / self.n_sel as f64).sqrt();
        exploitation + novelty + exploration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unvisited_node_has_infinite_uct() {
        let node = MctsNode::root(vec!["Deregistered".into()]);
        assert!(node.uct(10, 1.4, 0.0).is_infinite());
    }

    #[test]
    fn visited_node_has_finite_uct() {
        let mut node = MctsNode::root(vec!["Deregistered".into()]);
        node.add_reward(1.5);
        node.n_sel = 3;
        assert!(node.uct(10, 1.4, 0.0).is_finite());
    }

    #[test]
    fn add_reward_increments_n_sel() {
        let mut node = MctsNode::root(vec!["Deregistered".into()]);
        node.add_reward(0.5);
        node.add_reward(0.5);
        assert_eq!(node.n_sel, 2);
        assert_eq!(node.reward, 1.0);
    }
}
