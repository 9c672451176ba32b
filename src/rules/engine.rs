//! Rule storage, evaluation and scheduling.
//!
//! The store is a bounded array of rules behind one mutex. The mutex is
//! held only for CRUD and snapshot reads; condition evaluation and
//! action dispatch run with the lock released so a slow SSH action can
//! never stall rule registration.
//!
//! Triggers that enqueue asynchronous actions get a provisional
//! execution record immediately; a reconcile task awaits the worker's
//! completion signals and amends that record and the failure counters
//! in place, so the history ring ends up reflecting what actually ran.
//!
//! Persistence follows the arbiter's tiering: rules live in the local
//! KV under indexed keys and are mirrored to removable storage as one
//! JSON file per rule. At startup the removable per-rule directory wins,
//! then the legacy single-file export, then the KV copy. The startup
//! load is deferred a few seconds on a worker task so removable media
//! has time to mount.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::clock::now_ms;
use crate::error::{Error, Result};
use crate::rules::history::{
    ExecutionRecord, ExecutionStatus, HistoryRing, TriggerSource, DEFAULT_HISTORY_SIZE,
};
use crate::rules::{ActionDispatcher, ActionOutcome, DispatchSummary, PendingCompletion, Rule};
use crate::storage::{LoadedFrom, StorageArbiter};
use crate::value::Value;
use crate::vars::VariableStore;

/// Entity-kind directory name on removable storage.
const ENTITY_KIND: &str = "rules";

/// KV key prefix; `rule.count` plus `rule.<index>` entries.
const KV_PREFIX: &str = "rule.";

/// Rule engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_rules: usize,
    pub exec_history_size: usize,
    pub deferred_load_delay_ms: u64,
    /// Period of the automatic evaluation scheduler.
    pub eval_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rules: 32,
            exec_history_size: DEFAULT_HISTORY_SIZE,
            deferred_load_delay_ms: 3000,
            eval_interval_ms: 1000,
        }
    }
}

/// Aggregate engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub total_triggers: u64,
    pub total_actions: u64,
    pub failed_actions: u64,
}

/// Outcome of evaluating one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalResult {
    /// Rule is disabled; nothing evaluated.
    Disabled,
    /// Cool-down window since the last trigger is still open.
    CoolingDown,
    /// Conditions evaluated false.
    NotTriggered,
    /// Conditions held and the action list was dispatched.
    Triggered,
}

struct EngineState {
    rules: Vec<Rule>,
    stats: EngineStats,
    history: HistoryRing,
    /// Previous samples of variables referenced by change-operators.
    prev_samples: HashMap<String, Value>,
}

/// The rule engine facade.
pub struct RuleEngine {
    config: EngineConfig,
    // Shared with reconcile tasks that amend history after queued
    // actions complete.
    state: Arc<Mutex<EngineState>>,
    vars: Arc<VariableStore>,
    dispatcher: Arc<ActionDispatcher>,
    arbiter: Arc<StorageArbiter>,
    shutdown: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RuleEngine {
    pub fn new(
        vars: Arc<VariableStore>,
        dispatcher: Arc<ActionDispatcher>,
        arbiter: Arc<StorageArbiter>,
        config: EngineConfig,
    ) -> Self {
        let history = HistoryRing::new(config.exec_history_size);
        Self {
            config,
            state: Arc::new(Mutex::new(EngineState {
                rules: Vec::new(),
                stats: EngineStats::default(),
                history,
                prev_samples: HashMap::new(),
            })),
            vars,
            dispatcher,
            arbiter,
            shutdown: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a rule, replacing any existing rule with the same id.
    /// A full store reports `Exhausted` and leaves state unchanged.
    pub fn register_rule(&self, rule: Rule) -> Result<()> {
        rule.validate()?;
        let mut state = self.lock();
        if let Some(existing) = state.rules.iter_mut().find(|r| r.id == rule.id) {
            *existing = rule;
            return Ok(());
        }
        if state.rules.len() >= self.config.max_rules {
            return Err(Error::Exhausted(format!(
                "rule store is full ({} rules)",
                self.config.max_rules
            )));
        }
        debug!("rule '{}' registered", rule.id);
        state.rules.push(rule);
        Ok(())
    }

    pub fn unregister_rule(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        let before = state.rules.len();
        state.rules.retain(|r| r.id != id);
        if state.rules.len() == before {
            return Err(Error::NotFound(format!("rule '{id}'")));
        }
        drop(state);
        self.arbiter.remove_mirror(ENTITY_KIND, id);
        Ok(())
    }

    pub fn get_rule(&self, id: &str) -> Option<Rule> {
        self.lock().rules.iter().find(|r| r.id == id).cloned()
    }

    pub fn list_rules(&self) -> Vec<Rule> {
        self.lock().rules.clone()
    }

    pub fn rule_count(&self) -> usize {
        self.lock().rules.len()
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut state = self.lock();
        let rule = state
            .rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::NotFound(format!("rule '{id}'")))?;
        rule.enabled = enabled;
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        self.lock().stats
    }

    /// Execution history, newest first.
    pub fn history(&self) -> Vec<ExecutionRecord> {
        self.lock().history.newest_first()
    }

    /// Execution history of one rule, newest first, bounded by `max`.
    pub fn history_by_id(&self, id: &str, max: usize) -> Vec<ExecutionRecord> {
        self.lock().history.by_rule(id, max)
    }

    /// Evaluates one rule and dispatches its actions when the condition
    /// group holds.
    pub async fn evaluate(&self, id: &str) -> Result<EvalResult> {
        let now = now_ms();
        let (conditions, actions) = {
            let state = self.lock();
            let rule = state
                .rules
                .iter()
                .find(|r| r.id == id)
                .ok_or_else(|| Error::NotFound(format!("rule '{id}'")))?;
            if !rule.enabled {
                return Ok(EvalResult::Disabled);
            }
            if rule.cooldown_ms > 0
                && rule.last_trigger_ms > 0
                && now.saturating_sub(rule.last_trigger_ms) < u64::from(rule.cooldown_ms)
            {
                return Ok(EvalResult::CoolingDown);
            }
            (rule.conditions.clone(), rule.actions.clone())
        };

        // Lock released: condition evaluation touches the variable store,
        // which has its own lock and must not nest inside the engine's.
        let matched = {
            let prev = {
                let state = self.lock();
                state.prev_samples.clone()
            };
            let held = conditions.eval(
                |name| self.vars.get(name),
                |name| prev.get(name).cloned(),
            );
            for item in &conditions.items {
                if self.vars.get(&item.variable).is_none() {
                    warn!("rule '{id}' references missing variable '{}'", item.variable);
                }
            }
            held
        };

        // Refresh previous samples so the next pass sees this one.
        {
            let mut state = self.lock();
            let tracked: Vec<String> = conditions
                .change_tracked_variables()
                .map(str::to_string)
                .collect();
            for name in tracked {
                if let Some(value) = self.vars.get(&name) {
                    state.prev_samples.insert(name, value);
                }
            }
        }

        if !matched {
            return Ok(EvalResult::NotTriggered);
        }

        let result = self.dispatcher.execute_array(&actions).await;
        self.finish_trigger(
            id,
            now,
            actions.len(),
            result.summary,
            result.pending,
            TriggerSource::Condition,
        );
        Ok(EvalResult::Triggered)
    }

    /// Forces a rule to fire, bypassing conditions and cool-down.
    pub async fn trigger(&self, id: &str) -> Result<DispatchSummary> {
        let actions = {
            let state = self.lock();
            let rule = state
                .rules
                .iter()
                .find(|r| r.id == id)
                .ok_or_else(|| Error::NotFound(format!("rule '{id}'")))?;
            rule.actions.clone()
        };
        let result = self.dispatcher.execute_array(&actions).await;
        let summary = result.summary;
        self.finish_trigger(
            id,
            now_ms(),
            actions.len(),
            summary,
            result.pending,
            TriggerSource::Manual,
        );
        Ok(summary)
    }

    fn finish_trigger(
        &self,
        id: &str,
        now: u64,
        action_count: usize,
        summary: DispatchSummary,
        pending: Vec<PendingCompletion>,
        trigger: TriggerSource,
    ) {
        let status = derive_status(summary.succeeded, summary.failed);
        let message = if pending.is_empty() {
            trigger_message(summary.succeeded, summary.failed, summary.skipped)
        } else {
            format!(
                "{} ({} pending)",
                trigger_message(summary.succeeded, summary.failed, summary.skipped),
                pending.len()
            )
        };

        let token = {
            let mut state = self.lock();
            if let Some(rule) = state.rules.iter_mut().find(|r| r.id == id) {
                rule.last_trigger_ms = now;
                rule.trigger_count += 1;
            }
            state.stats.total_triggers += 1;
            state.stats.total_actions += action_count as u64;
            state.stats.failed_actions += u64::from(summary.failed);
            state.history.push(ExecutionRecord {
                rule_id: id.to_string(),
                ts_ms: now,
                status,
                trigger,
                message,
                action_count: action_count as u32,
                failed_count: summary.failed,
            })
        };
        debug!("rule '{id}' fired: {status:?}");

        if pending.is_empty() {
            return;
        }
        // Queued actions were counted as succeeded provisionally; the
        // reconcile task folds their real outcome into the record and the
        // failure counters once the queue worker reports back.
        let state = self.state.clone();
        let rule_id = id.to_string();
        let handle = tokio::spawn(async move {
            let mut late_failures = 0u32;
            for completion in pending {
                match completion.await {
                    Ok(ActionOutcome::Failed) | Err(_) => late_failures += 1,
                    Ok(_) => {}
                }
            }
            let succeeded = summary.succeeded.saturating_sub(late_failures);
            let failed = summary.failed + late_failures;
            let status = derive_status(succeeded, failed);

            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.stats.failed_actions += u64::from(late_failures);
            let updated = state.history.update(token, |record| {
                record.status = status;
                record.failed_count = failed;
                record.message = trigger_message(succeeded, failed, summary.skipped);
            });
            if !updated && late_failures > 0 {
                warn!(
                    "rule '{rule_id}': {late_failures} queued action(s) failed after the \
                     history record was overwritten"
                );
            }
        });
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Evaluates every rule once. The rule list is snapshotted by index
    /// and each id re-resolved, so concurrent CRUD stays safe.
    pub async fn evaluate_all(&self) -> u32 {
        let count = self.lock().rules.len();
        let mut triggered = 0;
        for index in 0..count {
            let id = self.lock().rules.get(index).map(|r| r.id.clone());
            let Some(id) = id else {
                break;
            };
            match self.evaluate(&id).await {
                Ok(EvalResult::Triggered) => triggered += 1,
                Ok(_) => {}
                Err(e) => warn!("evaluation of rule '{id}' failed: {e}"),
            }
        }
        triggered
    }

    /// Persists every rule to the local KV in one transaction and
    /// mirrors per-rule files to removable storage best-effort.
    pub fn save(&self) -> Result<()> {
        let rules = self.list_rules();
        let mut entries = Vec::with_capacity(rules.len() + 1);
        entries.push((
            format!("{KV_PREFIX}count"),
            rules.len().to_string().into_bytes(),
        ));
        let mut mirrors = Vec::with_capacity(rules.len());
        for (index, rule) in rules.iter().enumerate() {
            let json = rule.to_json()?;
            entries.push((format!("{KV_PREFIX}{index}"), json.clone().into_bytes()));
            mirrors.push((rule.id.clone(), json.into_bytes()));
        }
        self.arbiter.kv().replace_prefix(KV_PREFIX, entries)?;
        for (id, json) in &mirrors {
            self.arbiter.mirror_entity(ENTITY_KIND, id, json);
        }
        info!("saved {} rules", rules.len());
        Ok(())
    }

    /// Loads rules honoring tier priority. Returns which tier won.
    pub fn load(&self) -> Result<LoadedFrom> {
        // Tier 1: per-rule directory on removable storage.
        if let Some(files) = self.arbiter.load_entity_dir(ENTITY_KIND) {
            let rules = decode_many(files.iter().map(|(stem, data)| (stem.as_str(), data)));
            let count = self.replace_all(rules);
            self.save()?; // write-back to local KV
            info!("loaded {count} rules from removable directory");
            return Ok(LoadedFrom::RemovableDir);
        }

        // Tier 2: legacy single-file export.
        if let Some(blob) = self.arbiter.load_legacy_file(ENTITY_KIND) {
            match serde_json::from_slice::<Vec<Rule>>(&blob) {
                Ok(rules) => {
                    let count = self.replace_all(rules);
                    self.save()?;
                    info!("loaded {count} rules from legacy removable file");
                    return Ok(LoadedFrom::RemovableLegacy);
                }
                Err(e) => warn!("legacy rules file undecodable: {e}"),
            }
        }

        // Tier 3: local KV.
        let kv = self.arbiter.kv();
        if let Some(count_blob) = kv.get(&format!("{KV_PREFIX}count"))? {
            let count: usize = String::from_utf8_lossy(&count_blob)
                .trim()
                .parse()
                .map_err(|e| Error::Parse(format!("rule count: {e}")))?;
            let mut rules = Vec::with_capacity(count);
            for index in 0..count {
                match kv.get(&format!("{KV_PREFIX}{index}"))? {
                    Some(blob) => match Rule::from_json(&String::from_utf8_lossy(&blob)) {
                        Ok(rule) => rules.push(rule),
                        Err(e) => warn!("rule slot {index} undecodable: {e}"),
                    },
                    None => warn!("rule slot {index} missing from kv"),
                }
            }
            let loaded = self.replace_all(rules);
            if loaded > 0 {
                // A KV-tier win while the medium is mounted refreshes the
                // per-rule directory.
                if self
                    .arbiter
                    .removable()
                    .is_some_and(|layout| layout.is_mounted())
                {
                    let exports: Vec<(String, Vec<u8>)> = self
                        .list_rules()
                        .iter()
                        .filter_map(|r| {
                            r.to_json().ok().map(|j| (r.id.clone(), j.into_bytes()))
                        })
                        .collect();
                    if let Err(e) = self.arbiter.export_entity_dir(ENTITY_KIND, &exports) {
                        warn!("rule export to removable storage failed: {e}");
                    }
                }
                info!("loaded {loaded} rules from local kv");
                return Ok(LoadedFrom::LocalKv);
            }
        }

        Ok(LoadedFrom::Empty)
    }

    fn replace_all(&self, rules: Vec<Rule>) -> usize {
        let mut state = self.lock();
        state.rules.clear();
        for rule in rules {
            if state.rules.len() >= self.config.max_rules {
                warn!("rule store full during load; dropping '{}'", rule.id);
                continue;
            }
            state.rules.push(rule);
        }
        state.rules.len()
    }

    /// Starts the periodic evaluation scheduler.
    pub fn start_scheduler(self: &Arc<Self>) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(engine.config.eval_interval_ms));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        engine.evaluate_all().await;
                    }
                    () = engine.shutdown.notified() => break,
                }
            }
            debug!("rule scheduler stopped");
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Spawns the deferred startup load so removable media can mount.
    pub fn spawn_deferred_load(self: &Arc<Self>) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(engine.config.deferred_load_delay_ms)).await;
            match engine.load() {
                Ok(tier) => debug!("deferred rule load complete ({tier:?})"),
                Err(e) => warn!("deferred rule load failed: {e}"),
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Stops the scheduler and joins every worker task.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

fn derive_status(succeeded: u32, failed: u32) -> ExecutionStatus {
    if failed == 0 && succeeded > 0 {
        ExecutionStatus::Success
    } else if succeeded == 0 && failed > 0 {
        ExecutionStatus::Failed
    } else if failed > 0 {
        ExecutionStatus::Partial
    } else {
        ExecutionStatus::Skipped
    }
}

fn trigger_message(succeeded: u32, failed: u32, skipped: u32) -> String {
    format!("{succeeded} ok, {failed} failed, {skipped} skipped")
}

fn decode_many<'a>(files: impl Iterator<Item = (&'a str, &'a Vec<u8>)>) -> Vec<Rule> {
    let mut rules = Vec::new();
    for (stem, data) in files {
        match Rule::from_json(&String::from_utf8_lossy(data)) {
            Ok(rule) => rules.push(rule),
            Err(e) => warn!("rule file '{stem}.json' undecodable: {e}"),
        }
    }
    rules
}
