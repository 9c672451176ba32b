//! Action execution with repeat policy, templates and the async queue.
//!
//! Cheap actions (LED, GPIO, device power, webhook, log, set-variable)
//! and inline SSH commands execute on the caller's task, in declaration
//! order. Registered SSH commands and local CLI commands are handed to
//! a dedicated worker through a bounded queue so a deep action list can
//! never exhaust the evaluator's stack. The enqueue reports `Queued`
//! immediately; each accepted job carries a oneshot responder whose
//! receiver is surfaced in the [`DispatchResult`], so the rule engine
//! can reconcile the real outcome into its execution history once the
//! worker finishes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::ports::{LedOp, Ports};
use crate::rules::{Action, ActionBody, LogLevel, RepeatMode, WHILE_TRUE_CAP};
use crate::ssh::{SshConfig, SshCredentials, SshSessionPool, TrustSettings};
use crate::storage::KvStore;
use crate::value::{Value, MAX_STRING_LEN};
use crate::vars::{Variable, VariableStore};

/// Queue depth for asynchronous actions.
const QUEUE_DEPTH: usize = 32;

/// A registered SSH command, executable by id through the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SshCommandDef {
    pub host_ref: String,
    pub command: String,
    #[serde(default = "default_ssh_cmd_timeout")]
    pub timeout_ms: u32,
}

fn default_ssh_cmd_timeout() -> u32 {
    10_000
}

/// Outcome of one action dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Success,
    Failed,
    /// Per-action condition was false; nothing ran.
    Skipped,
    /// Accepted by the asynchronous queue.
    Queued,
}

/// Resolves to the worker's outcome for one queued invocation. Errors
/// when the worker is torn down before the job ran.
pub type PendingCompletion = oneshot::Receiver<ActionOutcome>;

/// Aggregated result of an action list.
///
/// Queued invocations count as `succeeded` provisionally; their real
/// outcome arrives through [`DispatchResult::pending`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// Outcome of [`ActionDispatcher::execute_array`]: the immediate summary
/// plus one completion receiver per invocation accepted onto the queue.
pub struct DispatchResult {
    pub summary: DispatchSummary,
    pub pending: Vec<PendingCompletion>,
}

impl DispatchSummary {
    fn absorb(&mut self, outcome: ActionOutcome) {
        match outcome {
            ActionOutcome::Success | ActionOutcome::Queued => self.succeeded += 1,
            ActionOutcome::Failed => self.failed += 1,
            ActionOutcome::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Default)]
struct Stats {
    executed: AtomicU64,
    failed: AtomicU64,
    queued: AtomicU64,
    template_runs: AtomicU64,
}

/// Snapshot of dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub executed: u64,
    pub failed: u64,
    pub queued: u64,
    pub template_runs: u64,
}

enum QueuedJob {
    SshCmd {
        command_id: String,
        done: oneshot::Sender<ActionOutcome>,
    },
    Cli {
        command: String,
        capture_variable: Option<String>,
        timeout_ms: u32,
        done: oneshot::Sender<ActionOutcome>,
    },
    Shutdown,
}

struct Shared {
    vars: Arc<VariableStore>,
    ports: Ports,
    ssh_pool: SshSessionPool,
    /// Key store backing for `hosts.<ref>.key_id` credential resolution.
    kv: Option<Arc<KvStore>>,
    templates: Mutex<HashMap<String, Action>>,
    ssh_commands: Mutex<HashMap<String, SshCommandDef>>,
    stats: Stats,
}

/// Executes actions on behalf of the rule engine and manual triggers.
pub struct ActionDispatcher {
    shared: Arc<Shared>,
    queue_tx: mpsc::Sender<QueuedJob>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ActionDispatcher {
    /// Creates the dispatcher and starts its queue worker.
    pub fn new(vars: Arc<VariableStore>, ports: Ports, trust: TrustSettings) -> Self {
        Self::with_kv(vars, ports, trust, None)
    }

    /// Like [`ActionDispatcher::new`] with a KV handle so SSH actions can
    /// resolve stored keys referenced by `hosts.<ref>.key_id`.
    pub fn with_kv(
        vars: Arc<VariableStore>,
        ports: Ports,
        trust: TrustSettings,
        kv: Option<Arc<KvStore>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            vars,
            ports,
            ssh_pool: SshSessionPool::new(trust),
            kv,
            templates: Mutex::new(HashMap::new()),
            ssh_commands: Mutex::new(HashMap::new()),
            stats: Stats::default(),
        });
        let (queue_tx, mut queue_rx) = mpsc::channel::<QueuedJob>(QUEUE_DEPTH);

        let worker_shared = shared.clone();
        let worker = tokio::spawn(async move {
            while let Some(job) = queue_rx.recv().await {
                match job {
                    QueuedJob::Shutdown => break,
                    QueuedJob::SshCmd { command_id, done } => {
                        let outcome = worker_shared.run_ssh_command(&command_id).await;
                        worker_shared.note(outcome);
                        let _ = done.send(outcome);
                    }
                    QueuedJob::Cli {
                        command,
                        capture_variable,
                        timeout_ms,
                        done,
                    } => {
                        let outcome = worker_shared
                            .run_cli(&command, capture_variable.as_deref(), timeout_ms)
                            .await;
                        worker_shared.note(outcome);
                        let _ = done.send(outcome);
                    }
                }
            }
            debug!("action queue worker stopped");
        });

        Self {
            shared,
            queue_tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Registers a named action template.
    pub fn register_template(&self, id: &str, action: Action) {
        self.shared
            .templates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), action);
    }

    pub fn remove_template(&self, id: &str) -> bool {
        self.shared
            .templates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some()
    }

    /// Registers an SSH command executable by id through the queue.
    pub fn register_ssh_command(&self, id: &str, def: SshCommandDef) {
        self.shared
            .ssh_commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), def);
    }

    pub fn remove_ssh_command(&self, id: &str) -> bool {
        self.shared
            .ssh_commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            executed: self.shared.stats.executed.load(Ordering::Relaxed),
            failed: self.shared.stats.failed.load(Ordering::Relaxed),
            queued: self.shared.stats.queued.load(Ordering::Relaxed),
            template_runs: self.shared.stats.template_runs.load(Ordering::Relaxed),
        }
    }

    /// Executes one action (template delegation included), ignoring the
    /// repeat policy. Completion receivers of queued invocations are
    /// dropped; use [`ActionDispatcher::execute_array`] to observe them.
    pub async fn execute(&self, action: &Action) -> ActionOutcome {
        self.execute_collect(action, &mut Vec::new()).await
    }

    async fn execute_collect(
        &self,
        action: &Action,
        pending: &mut Vec<PendingCompletion>,
    ) -> ActionOutcome {
        let outcome = if let Some(template_id) = action
            .template_id
            .as_deref()
            .filter(|id| !id.is_empty())
        {
            let template = self
                .shared
                .templates
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(template_id)
                .cloned();
            match template {
                Some(template) => {
                    self.shared
                        .stats
                        .template_runs
                        .fetch_add(1, Ordering::Relaxed);
                    self.dispatch_body(&template.body, pending).await
                }
                None => {
                    warn!("action references unknown template '{template_id}'");
                    ActionOutcome::Failed
                }
            }
        } else {
            self.dispatch_body(&action.body, pending).await
        };
        self.shared.note(outcome);
        outcome
    }

    /// Executes one action honoring its per-action condition and repeat
    /// policy. Completion receivers of queued invocations are dropped;
    /// use [`ActionDispatcher::execute_array`] to observe them.
    pub async fn execute_with_repeat(&self, action: &Action) -> ActionOutcome {
        self.execute_with_repeat_collect(action, &mut Vec::new())
            .await
    }

    async fn execute_with_repeat_collect(
        &self,
        action: &Action,
        pending: &mut Vec<PendingCompletion>,
    ) -> ActionOutcome {
        if !self.condition_holds(action) {
            debug!("action skipped by per-action condition");
            return ActionOutcome::Skipped;
        }

        match action.repeat {
            RepeatMode::Once => self.execute_collect(action, pending).await,
            RepeatMode::Count => {
                let count = action.repeat_count.max(1);
                let mut any_failed = false;
                for i in 0..count {
                    if i > 0 {
                        tokio::time::sleep(Duration::from_millis(u64::from(
                            action.repeat_interval_ms,
                        )))
                        .await;
                        if !self.condition_holds(action) {
                            break;
                        }
                    }
                    if self.execute_collect(action, pending).await == ActionOutcome::Failed {
                        any_failed = true;
                    }
                }
                if any_failed {
                    ActionOutcome::Failed
                } else {
                    ActionOutcome::Success
                }
            }
            RepeatMode::WhileTrue => {
                let mut iterations = 0u32;
                let mut any_failed = false;
                while self.condition_holds(action) {
                    if iterations >= WHILE_TRUE_CAP {
                        warn!("while_true repeat hit the {WHILE_TRUE_CAP}-iteration cap");
                        break;
                    }
                    if self.execute_collect(action, pending).await == ActionOutcome::Failed {
                        any_failed = true;
                    }
                    iterations += 1;
                    tokio::time::sleep(Duration::from_millis(u64::from(
                        action.repeat_interval_ms,
                    )))
                    .await;
                }
                if any_failed {
                    ActionOutcome::Failed
                } else {
                    ActionOutcome::Success
                }
            }
        }
    }

    /// Executes an ordered action list: per-action pre-delay, repeat
    /// policy, and post-render settle delays after LED actions. Failures
    /// are recorded and the remaining actions still run. The result
    /// carries a completion receiver for every invocation accepted onto
    /// the queue so the caller can reconcile real outcomes later.
    pub async fn execute_array(&self, actions: &[Action]) -> DispatchResult {
        let mut summary = DispatchSummary::default();
        let mut pending = Vec::new();
        for action in actions {
            if action.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(u64::from(action.delay_ms))).await;
            }
            let outcome = self.execute_with_repeat_collect(action, &mut pending).await;
            summary.absorb(outcome);

            if outcome != ActionOutcome::Skipped
                && let ActionBody::Led { op, .. } = &action.body
            {
                // Let the matrix renderer settle before the next action.
                let settle_ms = match op {
                    LedOp::Effect => 100,
                    LedOp::Fill => 50,
                    LedOp::Set | LedOp::Clear => 20,
                };
                tokio::time::sleep(Duration::from_millis(settle_ms)).await;
            }
        }
        DispatchResult { summary, pending }
    }

    fn condition_holds(&self, action: &Action) -> bool {
        match &action.condition {
            None => true,
            Some(cond) => cond.eval(self.shared.vars.get(&cond.variable).as_ref(), None),
        }
    }

    async fn dispatch_body(
        &self,
        body: &ActionBody,
        pending: &mut Vec<PendingCompletion>,
    ) -> ActionOutcome {
        match body {
            ActionBody::SshCmdRef { command_id } => {
                let (done, completion) = oneshot::channel();
                let outcome = self.enqueue(QueuedJob::SshCmd {
                    command_id: command_id.clone(),
                    done,
                });
                if outcome == ActionOutcome::Queued {
                    pending.push(completion);
                }
                outcome
            }
            ActionBody::Cli {
                command,
                capture_variable,
                timeout_ms,
            } => {
                let (done, completion) = oneshot::channel();
                let outcome = self.enqueue(QueuedJob::Cli {
                    command: command.clone(),
                    capture_variable: capture_variable.clone(),
                    timeout_ms: *timeout_ms,
                    done,
                });
                if outcome == ActionOutcome::Queued {
                    pending.push(completion);
                }
                outcome
            }
            inline => self.shared.execute_inline(inline).await,
        }
    }

    fn enqueue(&self, job: QueuedJob) -> ActionOutcome {
        match self.queue_tx.try_send(job) {
            Ok(()) => {
                self.shared.stats.queued.fetch_add(1, Ordering::Relaxed);
                ActionOutcome::Queued
            }
            Err(e) => {
                warn!("action queue rejected job: {e}");
                ActionOutcome::Failed
            }
        }
    }

    /// Stops the queue worker after draining pending jobs.
    pub async fn shutdown(&self) {
        let _ = self.queue_tx.send(QueuedJob::Shutdown).await;
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        self.shared.ssh_pool.shutdown().await;
    }
}

impl Shared {
    fn note(&self, outcome: ActionOutcome) {
        self.stats.executed.fetch_add(1, Ordering::Relaxed);
        if outcome == ActionOutcome::Failed {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn execute_inline(&self, body: &ActionBody) -> ActionOutcome {
        let result = self.execute_inline_inner(body).await;
        match result {
            Ok(()) => ActionOutcome::Success,
            Err(e) => {
                warn!("action failed: {e}");
                ActionOutcome::Failed
            }
        }
    }

    async fn execute_inline_inner(&self, body: &ActionBody) -> Result<()> {
        match body {
            ActionBody::Led {
                device,
                pixel,
                rgb,
                effect,
                duration_ms,
                op,
            } => {
                self.ports
                    .led
                    .apply(
                        device,
                        *op,
                        *pixel,
                        (rgb[0], rgb[1], rgb[2]),
                        effect.as_deref(),
                        *duration_ms,
                    )
                    .await
            }
            ActionBody::Gpio {
                pin,
                level,
                pulse_ms,
            } => self.ports.gpio.write(*pin, *level, *pulse_ms).await,
            ActionBody::DeviceCtrl { device, verb } => {
                self.ports.device.control(device, *verb).await
            }
            ActionBody::Webhook { url, method, body } => {
                let status = self.ports.webhook.send(url, *method, body).await?;
                if status >= 400 {
                    return Err(Error::Internal(format!("webhook returned HTTP {status}")));
                }
                Ok(())
            }
            ActionBody::Log { level, message } => {
                match level {
                    LogLevel::Error => error!("{message}"),
                    LogLevel::Warn => warn!("{message}"),
                    LogLevel::Info => info!("{message}"),
                    LogLevel::Debug => debug!("{message}"),
                }
                Ok(())
            }
            ActionBody::SetVar { variable, value } => {
                if self.vars.exists(variable) {
                    self.vars.set(variable, value.clone())
                } else {
                    self.vars
                        .register(Variable::new(variable, value.clone(), "rule_action"))
                }
            }
            ActionBody::Ssh {
                host_ref,
                command,
                timeout_ms,
            } => {
                let exit_code = self.run_ssh(host_ref, command, *timeout_ms).await?;
                if exit_code != 0 {
                    return Err(Error::ExecFailed(format!(
                        "ssh command on '{host_ref}' exited {exit_code}"
                    )));
                }
                Ok(())
            }
            // Queued variants are routed before this point.
            ActionBody::SshCmdRef { command_id } => Err(Error::Internal(format!(
                "ssh_cmd_ref '{command_id}' must go through the queue"
            ))),
            ActionBody::Cli { command, .. } => Err(Error::Internal(format!(
                "cli '{command}' must go through the queue"
            ))),
        }
    }

    /// Resolves `hosts.<ref>.*` credentials from the variable store,
    /// falling back to the reference itself as address and `root`.
    fn resolve_ssh_config(&self, host_ref: &str, timeout_ms: u32) -> SshConfig {
        let get = |field: &str| self.vars.get_string(&format!("hosts.{host_ref}.{field}"));
        let host = get("ip").unwrap_or_else(|| host_ref.to_string());
        let username = get("username").unwrap_or_else(|| "root".to_string());
        let port = self
            .vars
            .get_int(&format!("hosts.{host_ref}.port"))
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(crate::ssh::DEFAULT_PORT);

        let mut credentials = SshCredentials::default();
        if let (Some(kv), Some(key_id)) = (self.kv.as_ref(), get("key_id")) {
            match crate::keys::KeyStore::new(kv).load_private(&key_id) {
                Ok(buffer) => credentials.key_data = Some(buffer),
                Err(e) => warn!("host '{host_ref}' names key '{key_id}' but it failed to load: {e}"),
            }
        }
        credentials.password = get("password");

        let mut config = SshConfig::new(host, username)
            .with_port(port)
            .with_credentials(credentials);
        config.timeout_ms = u64::from(timeout_ms);
        config
    }

    async fn run_ssh(&self, host_ref: &str, command: &str, timeout_ms: u32) -> Result<u32> {
        let config = self.resolve_ssh_config(host_ref, timeout_ms);
        let session = self.ssh_pool.get(config).await?;
        let mut session = session.lock().await;
        let output = session.exec(command).await?;
        drop(session);

        let exit_code = output.exit_code.unwrap_or(0);
        let var = format!("ssh.{host_ref}.exit_code");
        let value = Value::Int(exit_code as i32);
        let result = if self.vars.exists(&var) {
            self.vars.set_internal(&var, value)
        } else {
            self.vars.register(Variable::new(&var, value, "ssh_action"))
        };
        if let Err(e) = result {
            warn!("cannot record exit code for '{host_ref}': {e}");
        }
        if !output.stderr.is_empty() {
            debug!("ssh '{host_ref}' stderr: {}", output.stderr_lossy());
        }
        Ok(exit_code)
    }

    async fn run_ssh_command(&self, command_id: &str) -> ActionOutcome {
        let def = self
            .ssh_commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(command_id)
            .cloned();
        let Some(def) = def else {
            warn!("unknown registered ssh command '{command_id}'");
            return ActionOutcome::Failed;
        };
        match self.run_ssh(&def.host_ref, &def.command, def.timeout_ms).await {
            Ok(0) => ActionOutcome::Success,
            Ok(code) => {
                warn!("ssh command '{command_id}' exited {code}");
                ActionOutcome::Failed
            }
            Err(e) => {
                warn!("ssh command '{command_id}' failed: {e}");
                ActionOutcome::Failed
            }
        }
    }

    async fn run_cli(
        &self,
        command: &str,
        capture_variable: Option<&str>,
        timeout_ms: u32,
    ) -> ActionOutcome {
        let run = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output();
        let output = match tokio::time::timeout(Duration::from_millis(u64::from(timeout_ms)), run)
            .await
        {
            Err(_) => {
                warn!("cli command timed out after {timeout_ms}ms: {command}");
                return ActionOutcome::Failed;
            }
            Ok(Err(e)) => {
                warn!("cli command failed to spawn: {e}");
                return ActionOutcome::Failed;
            }
            Ok(Ok(output)) => output,
        };

        if let Some(var) = capture_variable {
            // Byte-bounded before decode so the value fits the store limit.
            let bounded = &output.stdout[..output.stdout.len().min(MAX_STRING_LEN)];
            let text = String::from_utf8_lossy(bounded);
            let value = Value::Str(text.trim_end().to_string());
            let result = if self.vars.exists(var) {
                self.vars.set_internal(var, value)
            } else {
                self.vars.register(Variable::new(var, value, "cli_action"))
            };
            if let Err(e) = result {
                warn!("cannot capture cli output into '{var}': {e}");
            }
        }

        if output.status.success() {
            ActionOutcome::Success
        } else {
            warn!("cli command exited {:?}: {command}", output.status.code());
            ActionOutcome::Failed
        }
    }
}
