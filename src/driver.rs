//! The per-round fuzz driver: ties the FSM, the two MCTS schedulers, the
//! corpus, and the Oracle together into one round of state selection,
//! path replay, feedback-guided fuzzing, and new-transition learning.
//!
//! Grounded on `core_fuzzer.py`'s `while True:` worker loop body. Epoch
//! gating, socket (re)connection, and process lifecycle are the caller's
//! job (`bin/worker.rs`, `sut.rs`); this module assumes a live transport
//! and runs exactly one round on it.

use std::collections::HashMap;
use std::path::Path as FsPath;

use libafl_bolts::rands::Rand;

use crate::corpus::{Corpus, Seed, SeedId};
use crate::error::Result;
use crate::fsm::{self, Fsm};
use crate::mcts::MctsSchedule;
use crate::oracle::{Oracle, TAG_SM_REACHABLE};
use crate::scanners::{self, GnbErrorDrain};
use crate::ue_link::{FuzzReply, UeResponse};

/// The 13 NAS symbols driven once each during seeding (§4.6 step 8,
/// Testable Scenario 1); session-management symbols are appended
/// separately since only session-management-reachable states see them.
pub const NAS_SYMBOLS: &[&str] = &[
    "registrationRequest",
    "registrationComplete",
    "deregistrationRequest",
    "serviceRequest",
    "securityModeReject",
    "authenticationResponse",
    "authenticationFailure",
    "deregistrationAccept",
    "securityModeComplete",
    "identityResponse",
    "configurationUpdateComplete",
    "gmmStatus",
    "ulNasTransport",
];

/// Session-management symbols (`symbols_sm`): gate the Oracle's `R` tag,
/// the SMF crash probe, and are appended to the seeding symbol list.
pub const SM_SYMBOLS: &[&str] = &[
    "PDUSessionEstablishmentRequest",
    "PDUSessionAuthenticationComplete",
    "PDUSessionModificationRequest",
    "PDUSessionModificationComplete",
    "PDUSessionModificationCommandReject",
    "PDUSessionReleaseRequest",
    "PDUSessionReleaseComplete",
    "gsmStatus",
];

/// The 12-symbol new-transition-learning probe alphabet (`symbols_fsm`).
/// Distinct from [`NAS_SYMBOLS`]: it adds `registrationRequestGUTI` and
/// drops `gmmStatus`/`ulNasTransport`.
pub const SYMBOLS_FSM: &[&str] = &[
    "registrationRequest",
    "registrationRequestGUTI",
    "registrationComplete",
    "deregistrationRequest",
    "serviceRequest",
    "securityModeReject",
    "authenticationResponse",
    "authenticationFailure",
    "deregistrationAccept",
    "securityModeComplete",
    "identityResponse",
    "configurationUpdateComplete",
];

/// Per-symbol retry budget while learning a new state or transition
/// (§4.2 step 2).
const NEW_STATE_LEARN_RETRIES: u32 = 10;

/// Counts the top-level JSON fields a decoded UE response actually
/// populated, per SPEC_FULL.md §9's field-window decision: each present
/// field is one write to the independent "fields" stream
/// `count_window_fields` reads back from.
fn count_response_fields(resp: &UeResponse) -> usize {
    let mut n = 0;
    if !resp.ret_type.is_empty() {
        n += 1;
    }
    if !resp.ret_msg.is_empty() {
        n += 1;
    }
    if !resp.new_msg.is_empty() {
        n += 1;
    }
    if resp.sht != 0 {
        n += 1;
    }
    if resp.secmod != 0 {
        n += 1;
    }
    if !resp.mm_status.is_empty() {
        n += 1;
    }
    if resp.byte_mut {
        n += 1;
    }
    n
}

/// Driver-level anti-stickiness: force a random root-child after this
/// many consecutive rounds landing on the MCTS root (§4.6 step 2).
const STUCK_ROOT_LIMIT: u32 = 3;

/// What the transport must support for a round to run. Implemented for
/// [`crate::ue_link::UeLink`]; tests provide a fake.
pub trait UeTransport {
    fn send_symbol(&mut self, symbol: &str) -> Result<UeResponse>;
    fn send_raw(&mut self, payload: &[u8]) -> Result<FuzzReply>;
}

impl UeTransport for crate::ue_link::UeLink {
    fn send_symbol(&mut self, symbol: &str) -> Result<UeResponse> {
        crate::ue_link::UeLink::send_symbol(self, symbol)
    }

    fn send_raw(&mut self, payload: &[u8]) -> Result<FuzzReply> {
        crate::ue_link::UeLink::send_raw(self, payload)
    }
}

/// What happened during one call to [`Driver::run_round`]. Every branch
/// in spec.md §4.6/§7 that isn't a hard error surfaces here rather than
/// as an `Err`, since a round aborting partway is normal operation, not
/// a fault — the worker loop just moves on to the next round.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// Alignment to the chosen target failed; counters were already
    /// rolled back.
    AlignmentFailed,
    /// Reached the target but the corpus isn't seeded enough yet; the
    /// state's `is_init` stays false.
    SeedingNotReady,
    /// The core didn't acknowledge `enableFuzzing`.
    FuzzingNotEnabled,
    /// The UE dropped the connection or returned garbage mid-fuzz.
    UeCrashSuspected,
    /// A full fuzz iteration completed.
    Completed(RoundSummary),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundSummary {
    pub state: String,
    pub reward: f64,
    pub is_new_state: bool,
    pub is_new_transition: bool,
    pub violation: bool,
    pub if_crash: bool,
    pub if_crash_sm: bool,
    pub pending_global_reset: bool,
}

/// Owns one worker's process-local FSM/MCTS/corpus/Oracle state and runs
/// rounds against it. The FSM, MCTS trees, and corpus are process-local
/// per spec.md §5 ("Shared-resource policy").
pub struct Driver {
    pub wid: u32,
    pub fsm: Fsm,
    pub fsm_sm: Fsm,
    pub schedule_amf: MctsSchedule,
    pub schedule_smf: MctsSchedule,
    pub corpus: Corpus,
    pub oracle: Oracle,
    error_hits: HashMap<String, u32>,
    stuck_root: u32,
}

impl Driver {
    pub fn new(wid: u32, fsm: Fsm, fsm_sm: Fsm, oracle: Oracle) -> Self {
        let mut schedule_amf = MctsSchedule::new(fsm.init_state.clone());
        let mut schedule_smf = MctsSchedule::new(fsm_sm.init_state.clone());
        schedule_amf.warm_expand_root(&fsm);
        schedule_smf.warm_expand_root(&fsm_sm);
        Driver {
            wid,
            fsm,
            fsm_sm,
            schedule_amf,
            schedule_smf,
            corpus: Corpus::new(),
            oracle,
            error_hits: HashMap::new(),
            stuck_root: 0,
        }
    }

    /// Runs one round: target selection, alignment, seeding, and (once
    /// seeded) one fuzzing iteration. `now_tag` timestamps crash-log
    /// filenames; `crash_log_dir`/`core_log` locate the core's log.
    #[allow(clippy::too_many_arguments)]
    pub fn run_round<T: UeTransport, R: Rand>(
        &mut self,
        ue: &mut T,
        rand: &mut R,
        gnb_drain: &mut GnbErrorDrain,
        core_log: &FsPath,
        crash_log_dir: &FsPath,
        now_tag: &str,
    ) -> Result<RoundOutcome> {
        let (leaf_amf, _) = self.schedule_amf.choose_state(&self.fsm, rand);
        let leaf_amf = self.apply_driver_anti_stickiness(leaf_amf, rand);
        let target_amf = self.schedule_amf.node(leaf_amf).state_path.last().unwrap().clone();

        let used_smf = self.oracle.is_tagged(&target_amf, TAG_SM_REACHABLE);
        let (leaf_smf, target_smf) = if used_smf {
            let (leaf, _) = self.schedule_smf.choose_state(&self.fsm_sm, rand);
            let name = self.schedule_smf.node(leaf).state_path.last().unwrap().clone();
            (Some(leaf), Some(name))
        } else {
            (None, None)
        };

        let composite_state = match &target_smf {
            Some(sm) => format!("{target_amf}:{sm}"),
            None => target_amf.clone(),
        };

        // AMF alignment.
        let path_idx = self.fsm.states.get_mut(&target_amf).and_then(|s| s.select_path(rand));
        let path = path_idx.and_then(|idx| self.fsm.states.get(&target_amf).unwrap().paths.get(idx).cloned());
        let (ok_amf, state_seq_amf, ret_seq_amf) =
            exec_sequence_align(&self.fsm, &self.fsm.init_state.clone(), path.as_ref(), ue, rand);

        let reached_amf = state_seq_amf.last().cloned().unwrap_or_default();
        if reached_amf != target_amf {
            self.schedule_amf.bump_sink_hits(&reached_amf, 2);
            self.schedule_amf.bump_state_visits(&target_amf, 3);
        }
        let mcts_path_amf = if state_seq_amf.is_empty() {
            vec![self.schedule_amf.root()]
        } else {
            self.schedule_amf.nodes_from_state_seq(&state_seq_amf)
        };

        if !ok_amf {
            if let Some(state) = self.fsm.states.get_mut(&target_amf) {
                state.undo_select();
            }
            return Ok(RoundOutcome::AlignmentFailed);
        }

        if let Some(state) = self.fsm.states.get_mut(&target_amf) {
            state.visited = true;
        }
        mark_alignment_edges(&mut self.fsm, &state_seq_amf, &path, &ret_seq_amf);
        for name in &state_seq_amf {
            self.schedule_amf.bump_state_visits(name, 1);
        }
        if let (Some(idx), Some(state)) = (path_idx, self.fsm.states.get_mut(&target_amf)) {
            state.paths[idx].mark_succeeded();
        }

        // SMF alignment, if engaged.
        let mut mcts_path_smf = Vec::new();
        if let (Some(target_smf), Some(_)) = (&target_smf, leaf_smf) {
            let path_idx_sm = self.fsm_sm.states.get_mut(target_smf).and_then(|s| s.select_path(rand));
            let path_sm = path_idx_sm.and_then(|idx| self.fsm_sm.states.get(target_smf).unwrap().paths.get(idx).cloned());
            let (ok_smf, state_seq_smf, ret_seq_smf) =
                exec_sequence_align(&self.fsm_sm, &self.fsm_sm.init_state.clone(), path_sm.as_ref(), ue, rand);

            let reached_smf = state_seq_smf.last().cloned().unwrap_or_default();
            if &reached_smf != target_smf {
                self.schedule_smf.bump_sink_hits(&reached_smf, 2);
                self.schedule_smf.bump_state_visits(target_smf, 3);
            }
            mcts_path_smf = if state_seq_smf.is_empty() {
                vec![self.schedule_smf.root()]
            } else {
                self.schedule_smf.nodes_from_state_seq(&state_seq_smf)
            };

            if !ok_smf {
                if let Some(state) = self.fsm_sm.states.get_mut(target_smf) {
                    state.undo_select();
                }
                return Ok(RoundOutcome::AlignmentFailed);
            }
            if let Some(state) = self.fsm_sm.states.get_mut(target_smf) {
                state.visited = true;
            }
            mark_alignment_edges(&mut self.fsm_sm, &state_seq_smf, &path_sm, &ret_seq_smf);
            for name in &state_seq_smf {
                self.schedule_smf.bump_state_visits(name, 1);
            }
            if let (Some(idx), Some(state)) = (path_idx_sm, self.fsm_sm.states.get_mut(target_smf)) {
                state.paths[idx].mark_succeeded();
            }
        }

        let enable = ue.send_symbol("enableFuzzing")?;
        if enable.ret_type != "Start fuzzing" {
            return Ok(RoundOutcome::FuzzingNotEnabled);
        }

        let already_init = self
            .fsm
            .states
            .get(&target_amf)
            .map(|s| s.is_init)
            .unwrap_or(false);
        if !already_init {
            for symbol in NAS_SYMBOLS.iter().chain(SM_SYMBOLS.iter()) {
                let resp = ue.send_symbol(symbol)?;
                for _ in 0..count_response_fields(&resp) {
                    self.corpus.record_field(self.wid);
                }
                self.oracle.observe_ok(&composite_state, symbol, &resp.ret_type, resp.sht, resp.secmod);
                self.corpus.store_new_message(seeding_seed(self.wid, &composite_state, symbol, &resp));
            }
        }

        let ready = self.corpus.check_seed_msg(&composite_state);
        if let Some(state) = self.fsm.states.get_mut(&target_amf) {
            state.is_init = ready;
        }
        if !ready {
            return Ok(RoundOutcome::SeedingNotReady);
        }

        self.run_fuzz_iteration(
            ue,
            rand,
            gnb_drain,
            core_log,
            crash_log_dir,
            now_tag,
            &composite_state,
            &target_amf,
            mcts_path_amf,
            &target_smf,
            mcts_path_smf,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn run_fuzz_iteration<T: UeTransport, R: Rand>(
        &mut self,
        ue: &mut T,
        rand: &mut R,
        gnb_drain: &mut GnbErrorDrain,
        core_log: &FsPath,
        crash_log_dir: &FsPath,
        now_tag: &str,
        state: &str,
        target_amf: &str,
        mcts_path_amf: Vec<crate::mcts::NodeId>,
        target_smf: &Option<String>,
        mcts_path_smf: Vec<crate::mcts::NodeId>,
    ) -> Result<RoundOutcome> {
        ue.send_symbol("syncDown")?;
        let window = self.corpus.begin_field_window();

        let seed_id = match self.corpus.get_interesting_msg(state, rand) {
            Ok(id) => id,
            Err(_) => return Ok(RoundOutcome::SeedingNotReady),
        };
        let seed = self.corpus.seed(seed_id).unwrap().clone();

        ue.send_symbol(&format!("incomingMessage_{}", seed.size))?;
        if seed.send_type == "serviceRequest" {
            crate::sut::send_rrc_release()?;
        }

        let reply = match ue.send_raw(seed.new_msg.as_bytes()) {
            Ok(r) => r,
            Err(_) => return Ok(RoundOutcome::UeCrashSuspected),
        };
        let resp = match reply {
            FuzzReply::Crashed => return Ok(RoundOutcome::UeCrashSuspected),
            FuzzReply::DecodeError => {
                self.corpus.reset_interesting(seed_id);
                return Ok(RoundOutcome::UeCrashSuspected);
            }
            FuzzReply::Response(r) => r,
        };

        for _ in 0..count_response_fields(&resp) {
            self.corpus.record_field(self.wid);
        }

        let byte_mut = resp.byte_mut;
        let mut is_interesting = false;
        if !byte_mut {
            is_interesting = self.corpus.check_new_response(state, &seed.send_type, &resp.ret_msg, &resp.mm_status);
        }
        if is_interesting {
            self.corpus.add_energy(seed_id, 1.0);
        }

        let mut if_error = false;
        let mut error_cause = String::new();
        let causes = gnb_drain.drain_since_last()?;
        if let Some(cause) = causes.into_iter().last() {
            if_error = true;
            error_cause = cause;
            if !byte_mut {
                let cause_interesting = self.corpus.check_new_cause(state, &seed.send_type, &error_cause);
                if cause_interesting {
                    self.corpus.add_energy(seed_id, 0.5);
                }
                is_interesting = is_interesting || cause_interesting;
            }
        }

        let mut pending_global_reset = false;
        let core_text = std::fs::read_to_string(core_log).unwrap_or_default();
        let (if_crash, amf_incidents) = scanners::check_amf_crash(&core_text);
        if if_crash {
            pending_global_reset = true;
            let crash_log = crash_log_dir.join(format!("crash_amf_worker{}_{now_tag}.log", self.wid));
            if std::fs::create_dir_all(crash_log_dir).is_ok() {
                let _ = std::fs::copy(core_log, &crash_log);
            }
            log::warn!("AMF crash: {} incidents, saved to {}", amf_incidents.len(), crash_log.display());
        }

        let mut violation = self
            .oracle
            .query_message(state, &seed.send_type, &resp.ret_type, resp.sht, resp.secmod);
        if violation {
            violation = self.corpus.check_new_violation(state, &seed.send_type, &resp.ret_type, resp.sht, resp.secmod);
        }

        let mut if_crash_sm = false;
        if SM_SYMBOLS.contains(&seed.send_type.as_str()) {
            let (crashed, smf_incidents) = scanners::check_smf_crash(&core_text);
            if_crash_sm = crashed;
            if if_crash_sm {
                let crash_log = crash_log_dir.join(format!("crash_smf_worker{}_{now_tag}.log", self.wid));
                if std::fs::create_dir_all(crash_log_dir).is_ok() {
                    let _ = std::fs::copy(core_log, &crash_log);
                }
                log::warn!("SMF crash: {} incidents, saved to {}", smf_incidents.len(), crash_log.display());
            }
        }

        self.corpus.store_new_message(Seed {
            id: SeedId(0),
            worker_id: self.wid,
            if_fuzz: true,
            state: state.to_string(),
            send_type: seed.send_type.clone(),
            ret_type: resp.ret_type.clone(),
            if_crash,
            if_crash_sm,
            is_interesting,
            if_error,
            error_cause: error_cause.clone(),
            sht: resp.sht,
            secmod: resp.secmod,
            size: seed.new_msg.len(),
            base_msg: seed.new_msg.clone(),
            new_msg: resp.new_msg.clone(),
            ret_msg: resp.ret_msg.clone(),
            energy: 0.0,
            mutate_count: 0,
            violation,
            mm_status: resp.mm_status.clone(),
            byte_mut,
        });

        let mut is_new_state = false;
        let mut is_new_transition = false;
        if !resp.ret_type.is_empty()
            && !byte_mut
            && !self.fsm.search_new_transition(target_amf, &seed.send_type, &resp.ret_type)
        {
            match self.learn_new_transition(ue, rand, target_amf, &seed.send_type, &resp)? {
                Some(new_state) => {
                    is_new_transition = true;
                    is_new_state = new_state;
                }
                None => {}
            }
        }

        ue.send_symbol("syncUp")?;

        let error_flag = violation || if_crash || if_crash_sm;
        let mut error_bonus = 0.0;
        if error_flag {
            let hits = self.error_hits.entry(state.to_string()).or_insert(0);
            *hits += 1;
            error_bonus = 1.0 / (*hits as f64).sqrt();
        }
        let new_fields = self.corpus.count_window_fields(self.wid, window);

        let reward = self.schedule_amf.backpropagate(&mcts_path_amf, is_new_state, is_new_transition, error_bonus, new_fields);
        if target_smf.is_some() {
            self.schedule_smf.backpropagate(&mcts_path_smf, is_new_state, is_new_transition, error_bonus, new_fields);
        }
        self.corpus.update_msg_reward(seed_id, reward);

        Ok(RoundOutcome::Completed(RoundSummary {
            state: state.to_string(),
            reward,
            is_new_state,
            is_new_transition,
            violation,
            if_crash,
            if_crash_sm,
            pending_global_reset,
        }))
    }

    /// §4.2's new-transition learning algorithm. Returns `Ok(Some(true))`
    /// if a new state was minted, `Ok(Some(false))` if an existing state
    /// absorbed the transition, or `Ok(None)` if learning was abandoned
    /// after exhausting retries.
    fn learn_new_transition<T: UeTransport, R: Rand>(
        &mut self,
        ue: &mut T,
        rand: &mut R,
        state: &str,
        send_type: &str,
        resp: &UeResponse,
    ) -> Result<Option<bool>> {
        let message_str = format!("{send_type}:{}:{}:{}", resp.new_msg, resp.secmod, resp.sht);
        let mut responses = Vec::with_capacity(SYMBOLS_FSM.len());

        for symbol in SYMBOLS_FSM {
            let mut resolved = None;
            for _ in 0..NEW_STATE_LEARN_RETRIES {
                let replay = match ue.send_symbol(&message_str) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                if replay.ret_type != resp.ret_type {
                    continue;
                }
                let probe = match ue.send_symbol(symbol) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                if probe.ret_type.is_empty() {
                    continue;
                }
                resolved = Some(probe.ret_type);
                break;
            }
            match resolved {
                Some(out) => responses.push(out),
                None => return Ok(None),
            }
        }

        let matched_state = self.fsm.states.keys().cloned().find(|candidate| {
            SYMBOLS_FSM
                .iter()
                .zip(responses.iter())
                .all(|(sym, out)| self.fsm.search_transition(candidate, sym, out))
        });

        match matched_state {
            Some(dst) => {
                self.fsm.add_transition(state, &message_str, &resp.ret_type, &dst);
                self.fsm.refresh_all_paths(fsm_max_depth());
                Ok(Some(false))
            }
            None => {
                let new_state = self.fsm.add_new_state();
                self.fsm.add_transition(state, &message_str, &resp.ret_type, &new_state);
                for (symbol, out) in SYMBOLS_FSM.iter().zip(responses.iter()) {
                    self.fsm.add_transition(&new_state, symbol, out, &new_state);
                }
                self.fsm.refresh_all_paths(fsm_max_depth());
                self.oracle.decide_state(&new_state, send_type, SM_SYMBOLS);
                Ok(Some(true))
            }
        }
    }

    /// §4.6 step 2: force a random root-child after `STUCK_ROOT_LIMIT`
    /// consecutive rounds landing on the root.
    fn apply_driver_anti_stickiness<R: Rand>(&mut self, leaf: crate::mcts::NodeId, rand: &mut R) -> crate::mcts::NodeId {
        if leaf == self.schedule_amf.root() {
            self.stuck_root += 1;
        } else {
            self.stuck_root = 0;
        }
        if self.stuck_root >= STUCK_ROOT_LIMIT {
            self.stuck_root = 0;
            let children: Vec<_> = self.schedule_amf.node(self.schedule_amf.root()).children.values().copied().collect();
            if !children.is_empty() {
                let idx = rand.below(children.len() as u64) as usize;
                return children[idx];
            }
        }
        leaf
    }
}

/// Path enumeration's depth cap (§9's open question, decided in
/// [`crate::fsm`]); re-exported here since the learning algorithm needs
/// to re-run it after every FSM mutation.
fn fsm_max_depth() -> usize {
    12
}

fn seeding_seed(wid: u32, state: &str, send_type: &str, resp: &UeResponse) -> Seed {
    Seed {
        id: SeedId(0),
        worker_id: wid,
        if_fuzz: false,
        state: state.to_string(),
        send_type: send_type.to_string(),
        ret_type: String::new(),
        if_crash: false,
        if_crash_sm: false,
        is_interesting: true,
        if_error: false,
        error_cause: String::new(),
        sht: resp.sht,
        secmod: resp.secmod,
        size: resp.new_msg.len(),
        base_msg: String::new(),
        new_msg: resp.new_msg.clone(),
        ret_msg: String::new(),
        energy: 0.0,
        mutate_count: 0,
        violation: false,
        mm_status: resp.mm_status.clone(),
        byte_mut: false,
    }
}

/// Replays `path`'s input symbols from `start_state`, canonicalizing each
/// response and following the matching FSM transition, picking uniformly
/// among ties; falls back to any transition on the same `(src, input)`
/// when no output matches, and aborts if none exists at all (§4.6 step
/// 4). Returns whether the whole path aligned, the traversed state
/// sequence, and the canonicalized responses observed along the way.
pub fn exec_sequence_align<T: UeTransport, R: Rand>(
    fsm: &Fsm,
    start_state: &str,
    path: Option<&fsm::Path>,
    ue: &mut T,
    rand: &mut R,
) -> (bool, Vec<String>, Vec<UeResponse>) {
    let Some(path) = path else {
        return (true, vec![start_state.to_string()], vec![]);
    };

    let mut current = start_state.to_string();
    let mut state_seq = vec![current.clone()];
    let mut ret_seq = Vec::with_capacity(path.inputs.len());

    for input in &path.inputs {
        let resp = match ue.send_symbol(input) {
            Ok(r) => r,
            Err(_) => return (false, state_seq, ret_seq),
        };
        let output = resp.ret_type.clone();
        ret_seq.push(resp);

        let exact: Vec<&crate::fsm::Transition> = fsm
            .transitions
            .iter()
            .filter(|(s, i, o, _)| s == &current && i == input && o == &output)
            .collect();
        let chosen = if !exact.is_empty() {
            let idx = rand.below(exact.len() as u64) as usize;
            Some(exact[idx])
        } else {
            let any: Vec<&crate::fsm::Transition> =
                fsm.transitions.iter().filter(|(s, i, _, _)| s == &current && i == input).collect();
            if any.is_empty() {
                None
            } else {
                let idx = rand.below(any.len() as u64) as usize;
                Some(any[idx])
            }
        };

        match chosen {
            Some(t) => {
                current = t.3.clone();
                state_seq.push(current.clone());
            }
            None => return (false, state_seq, ret_seq),
        }
    }

    (true, state_seq, ret_seq)
}

/// Marks every edge the traversal actually crossed, per
/// `Fsm::mark_edges_from_seq`'s `(state_seq, input_seq, ret_seq)`
/// contract.
fn mark_alignment_edges(
    fsm: &mut Fsm,
    state_seq: &[String],
    path: &Option<fsm::Path>,
    ret_seq: &[UeResponse],
) {
    let Some(path) = path else { return };
    let seq: Vec<crate::fsm::Transition> = state_seq
        .windows(2)
        .zip(path.inputs.iter())
        .zip(ret_seq.iter())
        .map(|((pair, input), resp)| (pair[0].clone(), input.clone(), resp.ret_type.clone(), pair[1].clone()))
        .collect();
    fsm.mark_edges_from_seq(&seq);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ue_link::UeResponse;
    use libafl_bolts::rands::StdRand;
    use std::collections::VecDeque;

    /// A scripted transport: each call to `send_symbol`/`send_raw` pops
    /// the next canned reply, keyed by symbol for inspection in
    /// assertions.
    struct FakeTransport {
        symbol_replies: HashMap<String, VecDeque<UeResponse>>,
        raw_replies: VecDeque<FuzzReply>,
        default_reply: UeResponse,
    }

    impl FakeTransport {
        fn new() -> Self {
            FakeTransport {
                symbol_replies: HashMap::new(),
                raw_replies: VecDeque::new(),
                default_reply: UeResponse {
                    ret_type: "null_action".into(),
                    ..Default::default()
                },
            }
        }

        fn queue_symbol(&mut self, symbol: &str, resp: UeResponse) {
            self.symbol_replies.entry(symbol.to_string()).or_default().push_back(resp);
        }

        fn queue_raw(&mut self, reply: FuzzReply) {
            self.raw_replies.push_back(reply);
        }
    }

    impl UeTransport for FakeTransport {
        fn send_symbol(&mut self, symbol: &str) -> Result<UeResponse> {
            Ok(self
                .symbol_replies
                .get_mut(symbol)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| self.default_reply.clone()))
        }

        fn send_raw(&mut self, _payload: &[u8]) -> Result<FuzzReply> {
            Ok(self.raw_replies.pop_front().unwrap_or(FuzzReply::Crashed))
        }
    }

    fn tmp_log(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("nascorefuzz-driver-test-{name}-{}.log", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn exec_sequence_align_with_empty_path_is_trivially_ok() {
        let fsm = Fsm::new("Deregistered");
        let mut ue = FakeTransport::new();
        let mut rand = StdRand::with_seed(1);
        let (ok, seq, _) = exec_sequence_align(&fsm, "Deregistered", None, &mut ue, &mut rand);
        assert!(ok);
        assert_eq!(seq, vec!["Deregistered".to_string()]);
    }

    #[test]
    fn exec_sequence_align_follows_matching_transition() {
        let mut fsm = Fsm::new("Deregistered");
        fsm.states.insert("Registered".into(), crate::fsm::State::new("Registered"));
        fsm.add_transition("Deregistered", "regReq", "regAccept", "Registered");
        let path = fsm::Path::new(
            vec!["Deregistered".into(), "Registered".into()],
            vec!["regReq".into()],
            vec!["regAccept".into()],
        );
        let mut ue = FakeTransport::new();
        ue.queue_symbol("regReq", UeResponse { ret_type: "regAccept".into(), ..Default::default() });
        let mut rand = StdRand::with_seed(1);
        let (ok, seq, _) = exec_sequence_align(&fsm, "Deregistered", Some(&path), &mut ue, &mut rand);
        assert!(ok);
        assert_eq!(seq, vec!["Deregistered".to_string(), "Registered".to_string()]);
    }

    #[test]
    fn exec_sequence_align_fails_with_no_matching_edge() {
        let fsm = Fsm::new("Deregistered");
        let path = fsm::Path::new(
            vec!["Deregistered".into(), "Registered".into()],
            vec!["regReq".into()],
            vec!["regAccept".into()],
        );
        let mut ue = FakeTransport::new();
        ue.queue_symbol("regReq", UeResponse { ret_type: "somethingElse".into(), ..Default::default() });
        let mut rand = StdRand::with_seed(1);
        let (ok, seq, _) = exec_sequence_align(&fsm, "Deregistered", Some(&path), &mut ue, &mut rand);
        assert!(!ok);
        assert_eq!(seq, vec!["Deregistered".to_string()]);
    }

    fn sample_driver() -> Driver {
        let fsm = Fsm::new("Deregistered");
        let fsm_sm = Fsm::new("PDUSessionInactive");
        Driver::new(0, fsm, fsm_sm, Oracle::new())
    }

    #[test]
    fn round_stays_in_seeding_until_threshold() {
        let mut driver = sample_driver();
        let mut ue = FakeTransport::new();
        ue.queue_symbol("enableFuzzing", UeResponse { ret_type: "Start fuzzing".into(), ..Default::default() });
        // Every seeding symbol replies with the same body, so only the first
        // store_new_message call survives the corpus's dedup key and the
        // rest collapse as duplicates — leaving too few distinct seeds to
        // cross the 5-interesting threshold in this pass.
        for symbol in NAS_SYMBOLS.iter().chain(SM_SYMBOLS.iter()) {
            ue.queue_symbol(symbol, UeResponse { new_msg: "same-msg".into(), ..Default::default() });
        }
        let mut rand = StdRand::with_seed(9);
        let core_log = tmp_log("core-empty", "");
        let crash_dir = std::env::temp_dir().join("nascorefuzz-driver-test-crash");
        let mut drain = GnbErrorDrain::new(tmp_log("gnb-empty", ""));

        let outcome = driver
            .run_round(&mut ue, &mut rand, &mut drain, &core_log, &crash_dir, "20260101_000000")
            .unwrap();
        assert_eq!(outcome, RoundOutcome::SeedingNotReady);
        assert!(!driver.fsm.states.get("Deregistered").unwrap().is_init);
        assert!(!driver.corpus.check_seed_msg("Deregistered"));
    }

    #[test]
    fn round_completes_a_fuzz_iteration_once_seeded() {
        let mut driver = sample_driver();
        // Exclude "serviceRequest": sampling it would make run_fuzz_iteration
        // shell out to the real `nr-cli` via sut::send_rrc_release, which
        // isn't available in a test environment.
        for symbol in NAS_SYMBOLS.iter().chain(SM_SYMBOLS.iter()).filter(|s| **s != "serviceRequest") {
            driver.corpus.store_new_message(seeding_seed(
                0,
                "Deregistered",
                symbol,
                &UeResponse { new_msg: format!("{symbol}-msg"), ..Default::default() },
            ));
        }
        driver.fsm.states.get_mut("Deregistered").unwrap().is_init = true;

        let mut ue = FakeTransport::new();
        ue.queue_symbol("enableFuzzing", UeResponse { ret_type: "Start fuzzing".into(), ..Default::default() });
        ue.queue_raw(FuzzReply::Response(UeResponse {
            ret_type: "regAccept".into(),
            ret_msg: "regAccept".into(),
            new_msg: "mutated".into(),
            ..Default::default()
        }));

        let mut rand = StdRand::with_seed(3);
        let core_log = tmp_log("core-clean", "nothing interesting here");
        let crash_dir = std::env::temp_dir().join("nascorefuzz-driver-test-crash2");
        let mut drain = GnbErrorDrain::new(tmp_log("gnb-clean", ""));

        let outcome = driver
            .run_round(&mut ue, &mut rand, &mut drain, &core_log, &crash_dir, "20260101_000000")
            .unwrap();
        match outcome {
            RoundOutcome::Completed(summary) => {
                assert!((0.0..=1.0).contains(&summary.reward));
                assert!(!summary.if_crash);
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[test]
    fn ue_crash_during_fuzz_send_is_reported() {
        let mut driver = sample_driver();
        // Exclude "serviceRequest": sampling it would make run_fuzz_iteration
        // shell out to the real `nr-cli` via sut::send_rrc_release, which
        // isn't available in a test environment.
        for symbol in NAS_SYMBOLS.iter().chain(SM_SYMBOLS.iter()).filter(|s| **s != "serviceRequest") {
            driver.corpus.store_new_message(seeding_seed(
                0,
                "Deregistered",
                symbol,
                &UeResponse { new_msg: format!("{symbol}-msg"), ..Default::default() },
            ));
        }
        driver.fsm.states.get_mut("Deregistered").unwrap().is_init = true;

        let mut ue = FakeTransport::new();
        ue.queue_symbol("enableFuzzing", UeResponse { ret_type: "Start fuzzing".into(), ..Default::default() });
        ue.queue_raw(FuzzReply::Crashed);

        let mut rand = StdRand::with_seed(3);
        let core_log = tmp_log("core-crash-test", "");
        let crash_dir = std::env::temp_dir().join("nascorefuzz-driver-test-crash3");
        let mut drain = GnbErrorDrain::new(tmp_log("gnb-crash-test", ""));

        let outcome = driver
            .run_round(&mut ue, &mut rand, &mut drain, &core_log, &crash_dir, "20260101_000000")
            .unwrap();
        assert_eq!(outcome, RoundOutcome::UeCrashSuspected);
    }
}
