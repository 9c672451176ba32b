//! # rigger - Embedded Automation Controller Core
//!
//! `rigger` is the core of an embedded automation controller. It pairs an
//! SSH trust & execution stack (password/public-key authentication,
//! persisted host-key pinning with man-in-the-middle detection, command
//! execution, interactive PTY shells, TCP tunnelling, SFTP transfer)
//! with a declarative rule engine whose conditions are evaluated against
//! a live variable store and whose actions — including SSH-backed ones —
//! are dispatched with per-action conditions, repeat policies, cool-down
//! and execution-history telemetry.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rigger::ports::Ports;
//! use rigger::rules::{
//!     Action, ActionBody, ActionDispatcher, Condition, ConditionGroup, ConditionOp,
//!     EngineConfig, LogLevel, Rule, RuleEngine,
//! };
//! use rigger::ssh::TrustSettings;
//! use rigger::storage::{KvStore, StorageArbiter};
//! use rigger::value::Value;
//! use rigger::vars::{Variable, VariableStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), rigger::error::Error> {
//!     let kv = Arc::new(KvStore::open("/data/rigger.redb")?);
//!     let arbiter = Arc::new(StorageArbiter::new(kv, None));
//!     let vars = Arc::new(VariableStore::new());
//!     vars.register(Variable::new("temp", Value::Int(20), "sensor"))?;
//!
//!     let dispatcher = Arc::new(ActionDispatcher::new(
//!         vars.clone(),
//!         Ports::default(),
//!         TrustSettings::default(),
//!     ));
//!     let engine = Arc::new(RuleEngine::new(
//!         vars.clone(),
//!         dispatcher,
//!         arbiter,
//!         EngineConfig::default(),
//!     ));
//!
//!     let mut rule = Rule::new("hot", "High temperature");
//!     rule.cooldown_ms = 5000;
//!     rule.conditions = ConditionGroup::all(vec![Condition::new("temp", ConditionOp::Gt, 75)]);
//!     rule.actions.push(Action::new(ActionBody::Log {
//!         level: LogLevel::Warn,
//!         message: "temperature high".to_string(),
//!     }));
//!     engine.register_rule(rule)?;
//!
//!     engine.spawn_deferred_load();
//!     engine.start_scheduler();
//!
//!     vars.set("temp", Value::Int(80))?; // next scheduler pass fires the rule
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`ssh::SshSession`] - SSH transport state machine (connect, auth, exec, abort)
//! - [`known_hosts::KnownHostsStore`] - persisted host-key trust store
//! - [`keys::KeyStore`] - asymmetric key store with in-memory-only private material
//! - [`ssh::Shell`] / [`ssh::Sftp`] / [`ssh::PortForwarder`] - interactive consumers
//! - [`vars::VariableStore`] - namespaced typed variables with change events
//! - [`rules::RuleEngine`] / [`rules::ActionDispatcher`] - the automation engine
//! - [`storage::StorageArbiter`] - persistence tiering over KV and removable storage

pub mod config;
pub mod error;
pub mod keys;
pub mod known_hosts;
pub mod ports;
pub mod rules;
pub mod ssh;
pub mod storage;
pub mod value;
pub mod vars;

mod clock;
