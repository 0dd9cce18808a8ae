//! The MCTS state scheduler: picks which FSM state to drive the UE toward
//! next, balancing reward, novelty, and anti-stickiness.
//!
//! Grounded on `objects/mcts_schedule.py` (via its call sites in
//! `core_fuzzer.py`, since the module itself wasn't retrieved verbatim);
//! every hyperparameter below is carried over with its original name and
//! value.

use std::collections::{HashMap, HashSet, VecDeque};

use libafl_bolts::rands::Rand;
use serde::{Deserialize, Serialize};

use crate::fsm::{Fsm, Path};
use crate::mcts::node::{MctsNode, NodeId};

pub const MCTS_RHO: f64 = 1.4;
pub const STATE_REWARD: f64 = 1.0;
pub const TRANSITION_REWARD: f64 = 0.8;
pub const ERROR_REWARD: f64 = 0.4;
pub const FIELD_REWARD: f64 = 0.2;
pub const COV_BIAS: f64 = 1.2;
pub const DEPTH_GAMMA: f64 = 1.1;
pub const ALPHA_SINK: f64 = 0.15;
pub const EPSILON_ROOT: f64 = 0.10;
pub const MAX_CONSECUTIVE_SELECTIONS: u32 = 10;

/// A state is considered a sink once its hit counter reaches this many
/// zero-reward backpropagations without an intervening positive one. Not
/// pinned down by spec.md's prose (which only fixes `sink_hits`'s
/// increment/decay rule); decided here since `sink_states` needs a concrete
/// membership test for the expansion policy to consult. Recorded in
/// DESIGN.md.
const SINK_THRESHOLD: u32 = 3;

/// Bounded FIFO of the tail states of the most recently traversed paths,
/// capacity 64 per spec.md §3.
const LAST_TERMINALS_CAP: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MctsSchedule {
    nodes: Vec<MctsNode>,
    root: NodeId,
    /// Consecutive-selection counters keyed by state name, for the
    /// anti-stickiness rule in [`Self::choose_state`].
    selection_counter: HashMap<String, u32>,
    /// Sink-hit counters keyed by state name, decayed on every
    /// backpropagation that passes through that state without sinking.
    sink_hits: HashMap<String, u32>,
    /// Cumulative selections per state name, summed across every node
    /// whose tail is that state. Rebuilt from the tree on load.
    state_visits: HashMap<String, u64>,
    /// Tail states whose `sink_hits` has reached [`SINK_THRESHOLD`];
    /// avoided (but not excluded) at expansion time.
    sink_states: HashSet<String>,
    last_terminals: VecDeque<String>,
}

impl MctsSchedule {
    pub fn new(init_state: impl Into<String>) -> Self {
        let root = MctsNode::root(vec![init_state.into()]);
        MctsSchedule {
            nodes: vec![root],
            root: NodeId(0),
            selection_counter: HashMap::new(),
            sink_hits: HashMap::new(),
            state_visits: HashMap::new(),
            sink_states: HashSet::new(),
            last_terminals: VecDeque::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &MctsNode {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut MctsNode {
        &mut self.nodes[id.0]
    }

    fn add_child(&mut self, parent: NodeId, state_path: Vec<String>, state: &str) -> NodeId {
        if let Some(existing) = self.node(parent).children.get(state) {
            return *existing;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(MctsNode::child(state_path, parent));
        self.node_mut(parent).children.insert(state.to_string(), id);
        id
    }

    fn fully_expanded(&self, id: NodeId, fsm: &Fsm) -> bool {
        let tail = self.node(id).tail_state();
        let out_degree = fsm
            .transitions
            .iter()
            .filter(|(s, _, _, d)| s == tail && d != tail)
            .count();
        self.node(id).children.len() >= out_degree
    }

    fn outgoing_successors(&self, tail: &str, fsm: &Fsm) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (s, _, _, d) in &fsm.transitions {
            if s == tail && d != tail && seen.insert(d.clone()) {
                out.push(d.clone());
            }
        }
        out
    }

    /// Ensures the root has a child for every outgoing FSM successor of the
    /// root's tail state, so selection never starts from a totally bare
    /// tree.
    pub fn warm_expand_root(&mut self, fsm: &Fsm) {
        let root = self.root;
        let tail = self.node(root).tail_state().to_string();
        for dst in self.outgoing_successors(&tail, fsm) {
            if self.node(root).has_child(&dst) {
                continue;
            }
            let mut path = self.node(root).state_path.clone();
            path.push(dst.clone());
            self.add_child(root, path, &dst);
        }
    }

    /// `cov_bias / sqrt(state_visits[name] + 1)`: non-increasing in
    /// `state_visits[name]`.
    fn novelty(&self, state: &str) -> f64 {
        let visits = *self.state_visits.get(state).unwrap_or(&0) as f64;
        COV_BIAS / (visits + 1.0).sqrt()
    }

    fn child_score(&self, child: NodeId, parent_n_sel: u64) -> f64 {
        let node = self.node(child);
        let tail = node.tail_state();
        let novelty = self.novelty(tail);
        let sink_penalty = ALPHA_SINK * (*self.sink_hits.get(tail).unwrap_or(&0) as f64);
        node.uct(parent_n_sel, MCTS_RHO, novelty) - sink_penalty
    }

    /// Walks down from the root, selecting the best child by
    /// [`Self::child_score`] at each level, expanding a missing child from
    /// `fsm` when the current node isn't fully expanded, and applying the
    /// anti-stickiness and epsilon-root-exploration rules. Returns the
    /// chosen leaf's id and its state path.
    pub fn choose_state<R: Rand>(&mut self, fsm: &Fsm, rand: &mut R) -> (NodeId, Vec<String>) {
        let mut current = self.root;

        loop {
            if !self.fully_expanded(current, fsm) {
                if let Some(id) = self.expand(current, fsm) {
                    current = id;
                    break;
                }
            }
            let children: Vec<NodeId> = self.node(current).children.values().copied().collect();
            if children.is_empty() {
                break;
            }

            if current == self.root && rand.coinflip(EPSILON_ROOT) {
                if let Some(&min_child) = children.iter().min_by_key(|id| self.node(**id).n_sel) {
                    current = min_child;
                    continue;
                }
            }

            let parent_n_sel = self.node(current).n_sel;
            current = *children
                .iter()
                .max_by(|a, b| {
                    self.child_score(**a, parent_n_sel)
                        .partial_cmp(&self.child_score(**b, parent_n_sel))
                        .unwrap()
                })
                .unwrap();
        }

        self.apply_anti_stickiness(current, rand)
    }

    fn apply_anti_stickiness<R: Rand>(&mut self, selected: NodeId, rand: &mut R) -> (NodeId, Vec<String>) {
        let state = self.node(selected).tail_state().to_string();
        let counter = self.selection_counter.entry(state.clone()).or_insert(0);
        *counter += 1;
        let count = *counter;

        if count > 2 * MAX_CONSECUTIVE_SELECTIONS {
            self.selection_counter.clear();
        }

        if count >= MAX_CONSECUTIVE_SELECTIONS {
            let root = self.root;
            let candidates: Vec<NodeId> = self
                .node(root)
                .children
                .values()
                .copied()
                .filter(|id| self.node(*id).tail_state() != state)
                .collect();
            if !candidates.is_empty() {
                let idx = rand.below(candidates.len() as u64) as usize;
                let chosen = candidates[idx];
                return (chosen, self.node(chosen).state_path.clone());
            }
        } else {
            for (other, count) in self.selection_counter.iter_mut() {
                if other != &state {
                    *count = 0;
                }
            }
        }

        (selected, self.node(selected).state_path.clone())
    }

    /// Among the tail's unseen FSM successors, prefers one not currently a
    /// [`Self::sink_states`] member, breaking ties by minimum
    /// `state_visits`; falls back to the least-visited existing child when
    /// every successor is already a child.
    fn expand(&mut self, id: NodeId, fsm: &Fsm) -> Option<NodeId> {
        let tail = self.node(id).tail_state().to_string();
        let successors = self.outgoing_successors(&tail, fsm);
        let unseen: Vec<String> = successors
            .iter()
            .filter(|d| !self.node(id).has_child(d))
            .cloned()
            .collect();

        let candidate = if !unseen.is_empty() {
            let preferred: Vec<&String> = unseen.iter().filter(|d| !self.sink_states.contains(*d)).collect();
            let pool: Vec<&String> = if preferred.is_empty() { unseen.iter().collect() } else { preferred };
            pool.into_iter()
                .min_by_key(|d| *self.state_visits.get(d.as_str()).unwrap_or(&0))
                .cloned()?
        } else {
            self.node(id)
                .children
                .keys()
                .min_by_key(|d| *self.state_visits.get(d.as_str()).unwrap_or(&0))
                .cloned()?
        };

        let mut path = self.node(id).state_path.clone();
        path.push(candidate.clone());
        Some(self.add_child(id, path, &candidate))
    }

    /// Normalizes `(w_s, w_t, w_e, w_f)` against their sum and folds the
    /// four feedback signals into a single reward in `[0, 1]`, per spec.md
    /// §4.4's reward-computation formula.
    fn shape_reward(new_state: bool, new_transition: bool, error_reward: f64, new_fields_cnt: u64) -> f64 {
        let total = STATE_REWARD + TRANSITION_REWARD + ERROR_REWARD + FIELD_REWARD;
        let (w_s, w_t, w_e, w_f) = (
            STATE_REWARD / total,
            TRANSITION_REWARD / total,
            ERROR_REWARD / total,
            FIELD_REWARD / total,
        );
        let field_gain = (1.0 - (-(new_fields_cnt as f64) / 3.0).exp()).clamp(0.0, 1.0);
        let r = w_s * (new_state as u8 as f64)
            + w_t * (new_transition as u8 as f64)
            + w_e * error_reward.clamp(0.0, 1.0)
            + w_f * field_gain;
        r.clamp(0.0, 1.0)
    }

    /// Distributes the shaped reward along `path` (root-to-leaf node ids),
    /// weighting by `depth_γ^depth` so deeper nodes get a larger share, and
    /// updates sink bookkeeping for the path's tail. Returns the overall
    /// scalar reward `r`, as spec.md §4.4 requires.
    pub fn backpropagate(
        &mut self,
        path: &[NodeId],
        new_state: bool,
        new_transition: bool,
        error_reward: f64,
        new_fields_cnt: u64,
    ) -> f64 {
        let r = Self::shape_reward(new_state, new_transition, error_reward, new_fields_cnt);
        if path.is_empty() {
            return r;
        }

        let weights: Vec<f64> = (0..path.len()).map(|d| DEPTH_GAMMA.powi(d as i32)).collect();
        let weight_sum: f64 = weights.iter().sum();

        for (node_id, weight) in path.iter().zip(weights.iter()) {
            self.node_mut(*node_id).add_reward(r * weight / weight_sum);
            let tail = self.node(*node_id).tail_state().to_string();
            *self.state_visits.entry(tail).or_insert(0) += 1;
        }

        let tail = self.node(*path.last().unwrap()).tail_state().to_string();
        self.last_terminals.push_back(tail.clone());
        while self.last_terminals.len() > LAST_TERMINALS_CAP {
            self.last_terminals.pop_front();
        }

        let hits = self.sink_hits.entry(tail.clone()).or_insert(0);
        if r <= 1e-9 {
            *hits += 1;
            if *hits >= SINK_THRESHOLD {
                self.sink_states.insert(tail);
            }
        } else {
            if *hits > 0 {
                *hits -= 1;
            }
            if *hits < SINK_THRESHOLD {
                self.sink_states.remove(&tail);
            }
        }

        r
    }

    /// Bumps `state_visits[name]` by `delta`; used by the driver's
    /// misalignment penalty (spec.md §4.6 step 5: "increment ...
    /// `state_visits[target]` by 3").
    pub fn bump_state_visits(&mut self, name: &str, delta: u64) {
        *self.state_visits.entry(name.to_string()).or_insert(0) += delta;
    }

    /// Bumps `sink_hits[name]` by `delta`; used by the driver's
    /// misalignment penalty ("increment `sink_hits[reached]` by 2").
    pub fn bump_sink_hits(&mut self, name: &str, delta: u32) {
        let hits = self.sink_hits.entry(name.to_string()).or_insert(0);
        *hits += delta;
        if *hits >= SINK_THRESHOLD {
            self.sink_states.insert(name.to_string());
        }
    }

    /// Reconstructs (creating as needed) the chain of [`MctsNode`]s
    /// matching an FSM state sequence, rebasing at the root if the
    /// sequence doesn't already start there — the general form of
    /// `mcts_nodes_from_state_seq` in `core_fuzzer.py`.
    pub fn nodes_from_state_seq(&mut self, state_seq: &[String]) -> Vec<NodeId> {
        let root_state = self.node(self.root).tail_state().to_string();
        let start = match state_seq.first() {
            Some(first) if first == &root_state => 0,
            _ => state_seq.iter().position(|s| s == &root_state).unwrap_or(0),
        };

        let mut ids = vec![self.root];
        let mut cur = self.root;
        let mut built = vec![self.node(self.root).state_path.clone()];
        for state in &state_seq[start..] {
            if built.last().map(|p| p.last()) == Some(Some(state)) {
                continue;
            }
            let mut next_path = built.last().unwrap().clone();
            next_path.push(state.clone());
            cur = self.add_child(cur, next_path.clone(), state);
            built.push(next_path);
            ids.push(cur);
        }
        ids
    }

    /// Converts an FSM [`Path`] directly into its leaf [`NodeId`], for
    /// callers that only need the destination rather than the whole chain.
    pub fn path_from_fsm_path(&mut self, path: &Path) -> NodeId {
        *self.nodes_from_state_seq(&path.state_path).last().unwrap()
    }

    /// Rebuilds `state_visits` by summing every node's `n_sel` into
    /// `state_visits[node.tail]`, per spec.md §4.4's persistence rule.
    /// Call after [`Self`] has been deserialized from a snapshot.
    pub fn rebuild_state_visits(&mut self) {
        self.state_visits.clear();
        for node in &self.nodes {
            *self.state_visits.entry(node.tail_state().to_string()).or_insert(0) += node.n_sel;
        }
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| crate::error::Error::Other(e.to_string()))
    }

    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        let mut sched: MctsSchedule =
            serde_json::from_str(json).map_err(|e| crate::error::Error::Other(e.to_string()))?;
        sched.rebuild_state_visits();
        Ok(sched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::Fsm;
    use libafl_bolts::rands::StdRand;

    fn sample_fsm() -> Fsm {
        let mut fsm = Fsm::new("Deregistered");
        fsm.states.insert("Registered".into(), crate::fsm::State::new("Registered"));
        fsm.add_transition("Deregistered", "regReq", "regAccept", "Registered");
        fsm
    }

    #[test]
    fn choose_state_never_panics_on_small_fsm() {
        let fsm = sample_fsm();
        let mut sched = MctsSchedule::new("Deregistered");
        sched.warm_expand_root(&fsm);
        let mut rand = StdRand::with_seed(7);
        let (_, path) = sched.choose_state(&fsm, &mut rand);
        assert!(!path.is_empty());
    }

    #[test]
    fn backpropagation_increases_root_reward() {
        let fsm = sample_fsm();
        let mut sched = MctsSchedule::new("Deregistered");
        sched.warm_expand_root(&fsm);
        let leaf = *sched.node(sched.root()).children.values().next().unwrap();
        let path = vec![sched.root(), leaf];
        let r = sched.backpropagate(&path, true, false, 0.0, 0);
        assert!(sched.node(sched.root()).reward > 0.0);
        assert!((0.0..=1.0).contains(&r));
    }

    #[test]
    fn reward_is_always_bounded() {
        for ns in [false, true] {
            for nt in [false, true] {
                let r = MctsSchedule::shape_reward(ns, nt, 1.0, 1000);
                assert!((0.0..=1.0).contains(&r));
            }
        }
    }

    #[test]
    fn novelty_is_non_increasing_in_visits() {
        let fsm = sample_fsm();
        let mut sched = MctsSchedule::new("Deregistered");
        sched.warm_expand_root(&fsm);
        let before = sched.novelty("Registered");
        sched.bump_state_visits("Registered", 10);
        let after = sched.novelty("Registered");
        assert!(after <= before);
    }

    #[test]
    fn uct_tie_break_prefers_less_visited_state() {
        // Two children with identical n_sel/reward; the one with fewer
        // cumulative state_visits should score higher via novelty.
        let fsm = sample_fsm();
        let mut sched = MctsSchedule::new("Deregistered");
        sched.warm_expand_root(&fsm);
        let root = sched.root();
        let c1 = sched.add_child(root, vec!["Deregistered".into(), "C1".into()], "C1");
        let c2 = sched.add_child(root, vec!["Deregistered".into(), "C2".into()], "C2");
        for _ in 0..5 {
            sched.node_mut(c1).add_reward(0.5);
            sched.node_mut(c2).add_reward(0.5);
        }
        sched.bump_state_visits("C1", 10);
        sched.bump_state_visits("C2", 1);
        let parent_n_sel = sched.node(root).n_sel.max(1);
        assert!(sched.child_score(c2, parent_n_sel) > sched.child_score(c1, parent_n_sel));
    }

    #[test]
    fn anti_stickiness_forces_root_child_after_max_consecutive() {
        let fsm = sample_fsm();
        let mut sched = MctsSchedule::new("Deregistered");
        sched.warm_expand_root(&fsm);
        let root = sched.root();
        let other = sched.add_child(root, vec!["Deregistered".into(), "Other".into()], "Other");
        let _ = other;
        let mut rand = StdRand::with_seed(3);
        let target = sched.node(root).children.values().next().copied().unwrap();
        let tail = sched.node(target).tail_state().to_string();
        for _ in 0..MAX_CONSECUTIVE_SELECTIONS - 1 {
            let (_, path) = sched.apply_anti_stickiness(target, &mut rand);
            assert_eq!(*path.last().unwrap(), tail);
        }
        let (_, path) = sched.apply_anti_stickiness(target, &mut rand);
        assert_ne!(*path.last().unwrap(), tail);
    }
}
