//! In-process implementation of the mutation-corpus / seed-store
//! interface.
//!
//! Grounded on `db_helper.py`, which backs the same interface with a
//! MongoDB collection. The storage engine is out of scope here (per
//! spec.md §1); this module keeps every operation and invariant
//! `db_helper.py` defines, including the exact reward-update formula and
//! the `7E0056` response-collapse special case.

use std::collections::{HashMap, HashSet};

use libafl_bolts::rands::Rand;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const COUNT_REWARD: f64 = 1.0;
const LEN_REWARD: f64 = 0.5;
const BACK_REWARD: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeedId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seed {
    pub id: SeedId,
    pub worker_id: u32,
    pub if_fuzz: bool,
    pub state: String,
    pub send_type: String,
    pub ret_type: String,
    pub if_crash: bool,
    pub if_crash_sm: bool,
    pub is_interesting: bool,
    pub if_error: bool,
    pub error_cause: String,
    pub sht: i64,
    pub secmod: i64,
    pub size: usize,
    pub base_msg: String,
    pub new_msg: String,
    pub ret_msg: String,
    pub energy: f64,
    pub mutate_count: u64,
    pub violation: bool,
    pub mm_status: String,
    pub byte_mut: bool,
}

/// An opaque token marking a point in the field-write stream, returned by
/// [`Corpus::begin_field_window`].
#[derive(Debug, Clone, Copy)]
pub struct FieldWindowToken(u64);

#[derive(Debug, Default)]
pub struct Corpus {
    seeds: HashMap<SeedId, Seed>,
    unique_index: HashSet<(String, String, i64, i64)>,
    next_id: u64,
    /// `(worker_id, monotonic write counter)` — stands in for the
    /// original's `col_fields` collection, since its writer side was not
    /// part of the retrieved corpus (see SPEC_FULL.md §9).
    field_writes: Vec<(u32, u64)>,
    field_counter: u64,
}

impl Corpus {
    pub fn new() -> Self {
        Corpus::default()
    }

    /// Inserts a new seed unless `(state, new_msg, sht, secmod)` already
    /// exists, in which case the insert is silently swallowed (§7:
    /// "Corpus duplicate insert"). Returns whether the insert happened.
    #[allow(clippy::too_many_arguments)]
    pub fn store_new_message(&mut self, mut seed: Seed) -> bool {
        let key = (seed.state.clone(), seed.new_msg.clone(), seed.sht, seed.secmod);
        if self.unique_index.contains(&key) {
            return false;
        }
        self.unique_index.insert(key);
        self.next_id += 1;
        seed.id = SeedId(self.next_id);
        seed.energy = 1.0;
        seed.mutate_count = 0;
        self.seeds.insert(seed.id, seed);
        true
    }

    pub fn check_seed_msg(&self, state: &str) -> bool {
        self.seeds
            .values()
            .filter(|s| s.state == state && s.is_interesting)
            .count()
            >= 5
    }

    /// Picks uniformly among the top-10-by-energy interesting seeds for
    /// `state`, bumping its `mutate_count`. Errors if there are none.
    pub fn get_interesting_msg<R: Rand>(&mut self, state: &str, rand: &mut R) -> Result<SeedId> {
        let mut candidates: Vec<&Seed> = self
            .seeds
            .values()
            .filter(|s| s.state == state && s.is_interesting)
            .collect();
        if candidates.is_empty() {
            return Err(Error::Corpus(format!("no interesting messages for state {state}")));
        }
        candidates.sort_by(|a, b| b.energy.partial_cmp(&a.energy).unwrap());
        candidates.truncate(10);
        let idx = rand.below(candidates.len() as u64) as usize;
        let id = candidates[idx].id;
        self.seeds.get_mut(&id).unwrap().mutate_count += 1;
        Ok(id)
    }

    pub fn seed(&self, id: SeedId) -> Option<&Seed> {
        self.seeds.get(&id)
    }

    pub fn update_msg_reward(&mut self, id: SeedId, reward: f64) {
        if let Some(seed) = self.seeds.get_mut(&id) {
            let gain = COUNT_REWARD * (1.0 / (seed.mutate_count.max(1) as f64))
                + LEN_REWARD * (1.0 / (seed.size.max(1) as f64))
                + BACK_REWARD * reward;
            seed.energy += gain;
        }
    }

    pub fn add_energy(&mut self, id: SeedId, energy: f64) {
        if let Some(seed) = self.seeds.get_mut(&id) {
            seed.energy += energy;
        }
    }

    pub fn reset_interesting(&mut self, id: SeedId) {
        if let Some(seed) = self.seeds.get_mut(&id) {
            seed.is_interesting = false;
        }
    }

    /// `7E0056` (an authentication-failure cause) collapses any response
    /// carrying it to an equivalence class keyed only on
    /// `(state, send_type, "authenticationRequest")`, so repeated
    /// authentication challenges aren't each treated as a distinct novel
    /// response.
    pub fn check_new_response(&self, state: &str, send_type: &str, ret_msg: &str, mm_status: &str) -> bool {
        if ret_msg.contains("7E0056") {
            !self.seeds.values().any(|s| {
                s.state == state && s.send_type == send_type && s.ret_type == "authenticationRequest"
            })
        } else {
            !self
                .seeds
                .values()
                .any(|s| s.state == state && s.send_type == send_type && s.ret_msg == ret_msg && s.mm_status == mm_status)
        }
    }

    pub fn check_new_cause(&self, state: &str, send_type: &str, error_cause: &str) -> bool {
        !self
            .seeds
            .values()
            .any(|s| s.state == state && s.send_type == send_type && s.error_cause == error_cause)
    }

    pub fn check_new_violation(&self, state: &str, send_type: &str, ret_type: &str, sht: i64, secmod: i64) -> bool {
        !self.seeds.values().any(|s| {
            s.violation
                && s.state == state
                && s.send_type == send_type
                && s.ret_type == ret_type
                && s.sht == sht
                && s.secmod == secmod
        })
    }

    pub fn begin_field_window(&self) -> FieldWindowToken {
        FieldWindowToken(self.field_writes.last().map(|(_, c)| *c).unwrap_or(0))
    }

    pub fn record_field(&mut self, worker_id: u32) {
        self.field_counter += 1;
        self.field_writes.push((worker_id, self.field_counter));
    }

    pub fn count_window_fields(&self, worker_id: u32, since: FieldWindowToken) -> u64 {
        self.field_writes
            .iter()
            .filter(|(w, c)| *w == worker_id && *c > since.0)
            .count() as u64
    }

    /// Dumps every stored seed as JSON, ordered by insertion id. Stands in
    /// for `collect_outputs`'s `mongoexport` of the per-worker collection
    /// (§4.8 step 3's "corpus export" artifact), since the storage engine
    /// itself is out of scope and this crate's corpus is in-process.
    pub fn export_json(&self) -> Result<String> {
        let mut seeds: Vec<&Seed> = self.seeds.values().collect();
        seeds.sort_by_key(|s| s.id.0);
        serde_json::to_string_pretty(&seeds).map_err(|e| Error::Corpus(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libafl_bolts::rands::StdRand;

    fn sample_seed(state: &str, new_msg: &str) -> Seed {
        Seed {
            id: SeedId(0),
            worker_id: 0,
            if_fuzz: true,
            state: state.into(),
            send_type: "regRequest".into(),
            ret_type: "regAccept".into(),
            if_crash: false,
            if_crash_sm: false,
            is_interesting: true,
            if_error: false,
            error_cause: String::new(),
            sht: 0,
            secmod: 0,
            size: new_msg.len(),
            base_msg: String::new(),
            new_msg: new_msg.into(),
            ret_msg: "regAccept".into(),
            energy: 1.0,
            mutate_count: 0,
            violation: false,
            mm_status: String::new(),
            byte_mut: false,
        }
    }

    #[test]
    fn duplicate_insert_is_swallowed() {
        let mut corpus = Corpus::new();
        assert!(corpus.store_new_message(sample_seed("S0", "abc")));
        assert!(!corpus.store_new_message(sample_seed("S0", "abc")));
    }

    #[test]
    fn get_interesting_msg_errors_when_empty() {
        let mut corpus = Corpus::new();
        let mut rand = StdRand::with_seed(1);
        assert!(corpus.get_interesting_msg("S0", &mut rand).is_err());
    }

    #[test]
    fn get_interesting_msg_bumps_mutate_count() {
        let mut corpus = Corpus::new();
        corpus.store_new_message(sample_seed("S0", "abc"));
        let mut rand = StdRand::with_seed(1);
        let id = corpus.get_interesting_msg("S0", &mut rand).unwrap();
        assert_eq!(corpus.seed(id).unwrap().mutate_count, 1);
    }

    #[test]
    fn check_new_response_collapses_7e0056() {
        let mut corpus = Corpus::new();
        let mut seed = sample_seed("S0", "abc");
        seed.ret_type = "authenticationRequest".into();
        seed.ret_msg = "...7E0056...".into();
        corpus.store_new_message(seed);
        assert!(!corpus.check_new_response("S0", "regRequest", "...7E0056...", ""));
    }
}
