use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::settings::{BlacklistPolicy, BlacklistScope};
use crate::value::{ComputationTargetSpecification, FunctionId};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Bars invocations matching every field that is set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlacklistRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<FunctionId>,
    /// Function parameters in canonical JSON form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ComputationTargetSpecification>,
}

impl BlacklistRule {
    pub fn for_function(function_id: impl Into<FunctionId>) -> Self {
        Self {
            function_id: Some(function_id.into()),
            parameters: None,
            target: None,
        }
    }

    pub fn for_function_parameters(function_id: impl Into<FunctionId>, parameters: &Value) -> Self {
        Self {
            parameters: Some(parameters.to_string()),
            ..Self::for_function(function_id)
        }
    }

    pub fn for_function_on_target(
        function_id: impl Into<FunctionId>,
        parameters: &Value,
        target: ComputationTargetSpecification,
    ) -> Self {
        Self {
            target: Some(target),
            ..Self::for_function_parameters(function_id, parameters)
        }
    }

    /// Matches every invocation.
    #[must_use]
    pub fn wildcard() -> Self {
        Self {
            function_id: None,
            parameters: None,
            target: None,
        }
    }

    pub fn matches(
        &self,
        function_id: &str,
        parameters: &Value,
        target: &ComputationTargetSpecification,
    ) -> bool {
        self.function_id.as_deref().map_or(true, |f| f == function_id)
            && self
                .parameters
                .as_deref()
                .map_or(true, |p| p == parameters.to_string())
            && self.target.as_ref().map_or(true, |t| t == target)
    }
}

/// Delta published for every effective change to a blacklist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistUpdate {
    pub blacklist_name: String,
    pub modification_count: u64,
    pub rules_added: Vec<BlacklistRule>,
    pub rules_removed: Vec<BlacklistRule>,
}

impl BlacklistUpdate {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// # Errors
    ///
    /// Returns an error if the JSON is not a blacklist update message.
    pub fn from_json(json: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(json.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistSnapshot {
    pub name: String,
    pub modification_count: u64,
    pub rules: BTreeSet<BlacklistRule>,
}

/// The authoritative, versioned rule set.
///
/// Lookups read the sharded rule map without locking. Changes are serialised
/// by the writer lock so the modification count and the published deltas
/// advance together, one per effective change.
#[derive(Debug)]
pub struct FunctionBlacklist {
    name: String,
    rules: DashMap<BlacklistRule, Option<Instant>>,
    modification_count: AtomicU64,
    writer: Mutex<broadcast::Sender<BlacklistUpdate>>,
}

impl FunctionBlacklist {
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            rules: DashMap::new(),
            modification_count: AtomicU64::new(0),
            writer: Mutex::new(sender),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn modification_count(&self) -> u64 {
        self.modification_count.load(Ordering::Acquire)
    }

    /// Rules currently in force.
    pub fn rules(&self) -> BTreeSet<BlacklistRule> {
        let now = Instant::now();
        self.rules
            .iter()
            .filter(|entry| entry.value().map_or(true, |expiry| expiry > now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Adds rules; returns whether anything changed.
    pub fn add_rules<I>(&self, rules: I) -> bool
    where
        I: IntoIterator<Item = BlacklistRule>,
    {
        self.insert(rules, None)
    }

    /// Adds rules that stop matching once `ttl` has elapsed. Expired rules are
    /// dropped from the set by [`purge_expired`](Self::purge_expired).
    pub fn add_rules_with_ttl<I>(&self, rules: I, ttl: Duration) -> bool
    where
        I: IntoIterator<Item = BlacklistRule>,
    {
        self.insert(rules, Some(Instant::now() + ttl))
    }

    fn insert<I>(&self, rules: I, expiry: Option<Instant>) -> bool
    where
        I: IntoIterator<Item = BlacklistRule>,
    {
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let mut added = Vec::new();
        for rule in rules {
            // A rule in force keeps its expiry; an expired one counts as absent.
            match self.rules.entry(rule) {
                Entry::Occupied(mut entry) => {
                    if entry.get().is_some_and(|current| current <= now) {
                        entry.insert(expiry);
                        added.push(entry.key().clone());
                    }
                }
                Entry::Vacant(entry) => {
                    added.push(entry.key().clone());
                    entry.insert(expiry);
                }
            }
        }
        if added.is_empty() {
            return false;
        }
        self.publish(&writer, added, Vec::new());
        true
    }

    /// Removes rules; returns whether anything changed.
    pub fn remove_rules<I>(&self, rules: I) -> bool
    where
        I: IntoIterator<Item = BlacklistRule>,
    {
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let removed: Vec<BlacklistRule> = rules
            .into_iter()
            .filter_map(|rule| self.rules.remove(&rule).map(|(rule, _)| rule))
            .collect();
        if removed.is_empty() {
            return false;
        }
        self.publish(&writer, Vec::new(), removed);
        true
    }

    /// Drops every expired rule as a single change; returns how many went.
    pub fn purge_expired(&self) -> usize {
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let expired: Vec<BlacklistRule> = self
            .rules
            .iter()
            .filter(|entry| entry.value().is_some_and(|expiry| expiry <= now))
            .map(|entry| entry.key().clone())
            .collect();
        for rule in &expired {
            self.rules.remove(rule);
        }
        let purged = expired.len();
        if purged > 0 {
            self.publish(&writer, Vec::new(), expired);
        }
        purged
    }

    fn publish(
        &self,
        sender: &broadcast::Sender<BlacklistUpdate>,
        rules_added: Vec<BlacklistRule>,
        rules_removed: Vec<BlacklistRule>,
    ) {
        let modification_count = self.modification_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            "Blacklist {} at modification {modification_count}: +{} -{}",
            self.name,
            rules_added.len(),
            rules_removed.len()
        );
        // No subscribers is not an error.
        let _ = sender.send(BlacklistUpdate {
            blacklist_name: self.name.clone(),
            modification_count,
            rules_added,
            rules_removed,
        });
    }

    /// Full rule set at a single modification count, for resynchronising
    /// subscribers that missed deltas.
    pub fn snapshot(&self) -> BlacklistSnapshot {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        BlacklistSnapshot {
            name: self.name.clone(),
            modification_count: self.modification_count(),
            rules: self.rules(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BlacklistUpdate> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe()
    }

    pub fn is_blacklisted(
        &self,
        function_id: &str,
        parameters: &Value,
        target: &ComputationTargetSpecification,
    ) -> bool {
        let now = Instant::now();
        self.rules.iter().any(|entry| {
            entry.value().map_or(true, |expiry| expiry > now)
                && entry.key().matches(function_id, parameters, target)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaApply {
    Applied,
    /// Already reflected in the replica.
    Stale,
    /// Deltas are missing; the replica needs a snapshot.
    Gap,
}

#[derive(Debug, Default)]
struct ReplicaState {
    modification_count: u64,
    rules: HashSet<BlacklistRule>,
}

/// A subscriber's local copy of a blacklist, kept current from deltas.
#[derive(Debug, Default)]
pub struct BlacklistReplica {
    state: RwLock<ReplicaState>,
}

impl BlacklistReplica {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: BlacklistSnapshot) -> Self {
        let replica = Self::new();
        replica.resync(snapshot);
        replica
    }

    pub fn apply(&self, update: &BlacklistUpdate) -> ReplicaApply {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if update.modification_count <= state.modification_count {
            return ReplicaApply::Stale;
        }
        if update.modification_count != state.modification_count + 1 {
            return ReplicaApply::Gap;
        }
        for rule in &update.rules_added {
            state.rules.insert(rule.clone());
        }
        for rule in &update.rules_removed {
            state.rules.remove(rule);
        }
        state.modification_count = update.modification_count;
        ReplicaApply::Applied
    }

    pub fn resync(&self, snapshot: BlacklistSnapshot) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if snapshot.modification_count < state.modification_count {
            return;
        }
        debug!(
            "Resynchronised replica of {} at modification {}",
            snapshot.name, snapshot.modification_count
        );
        state.modification_count = snapshot.modification_count;
        state.rules = snapshot.rules.into_iter().collect();
    }

    pub fn modification_count(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .modification_count
    }

    pub fn rules(&self) -> BTreeSet<BlacklistRule> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rules
            .iter()
            .cloned()
            .collect()
    }

    pub fn is_blacklisted(
        &self,
        function_id: &str,
        parameters: &Value,
        target: &ComputationTargetSpecification,
    ) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rules
            .iter()
            .any(|rule| rule.matches(function_id, parameters, target))
    }
}

/// Keeps `replica` in step with `authority` until the authority is dropped.
pub fn spawn_replica_sync(
    authority: &Arc<FunctionBlacklist>,
    replica: Arc<BlacklistReplica>,
) -> JoinHandle<()> {
    let mut updates = authority.subscribe();
    replica.resync(authority.snapshot());
    let authority = Arc::downgrade(authority);

    tokio::spawn(async move {
        loop {
            let resync = match updates.recv().await {
                Ok(update) => replica.apply(&update) == ReplicaApply::Gap,
                Err(RecvError::Lagged(missed)) => {
                    warn!("Blacklist replica lagged by {missed} updates");
                    true
                }
                Err(RecvError::Closed) => break,
            };
            if resync {
                let Some(authority) = authority.upgrade() else {
                    break;
                };
                replica.resync(authority.snapshot());
            }
        }
        debug!("Blacklist replica sync stopped");
    })
}

#[derive(Debug, Default)]
struct FailureHistory {
    consecutive: u32,
    recent: VecDeque<bool>,
}

/// Turns repeated function faults into blacklist rules.
#[derive(Debug)]
pub struct BlacklistPolicyEnforcer {
    policy: BlacklistPolicy,
    blacklist: Arc<FunctionBlacklist>,
    history: DashMap<BlacklistRule, FailureHistory>,
}

impl BlacklistPolicyEnforcer {
    pub fn new(policy: BlacklistPolicy, blacklist: Arc<FunctionBlacklist>) -> Self {
        Self {
            policy,
            blacklist,
            history: DashMap::new(),
        }
    }

    pub fn blacklist(&self) -> &Arc<FunctionBlacklist> {
        &self.blacklist
    }

    fn rule_for(
        &self,
        function_id: &str,
        parameters: &Value,
        target: &ComputationTargetSpecification,
    ) -> BlacklistRule {
        match self.policy.scope {
            BlacklistScope::Function => BlacklistRule::for_function(function_id),
            BlacklistScope::FunctionParameters => {
                BlacklistRule::for_function_parameters(function_id, parameters)
            }
            BlacklistScope::FunctionTarget => {
                BlacklistRule::for_function_on_target(function_id, parameters, target.clone())
            }
        }
    }

    fn window(&self) -> usize {
        self.policy.failure_rate.as_ref().map_or(0, |rate| rate.window)
    }

    pub fn record_success(
        &self,
        function_id: &str,
        parameters: &Value,
        target: &ComputationTargetSpecification,
    ) {
        let window = self.window();
        let key = self.rule_for(function_id, parameters, target);
        if window == 0 {
            if let Some(mut history) = self.history.get_mut(&key) {
                history.consecutive = 0;
            }
            return;
        }
        let mut history = self.history.entry(key).or_default();
        history.consecutive = 0;
        history.recent.push_back(false);
        while history.recent.len() > window {
            history.recent.pop_front();
        }
    }

    /// Records a function fault; returns the rule added when this fault
    /// crossed the policy's threshold.
    pub fn record_failure(
        &self,
        function_id: &str,
        parameters: &Value,
        target: &ComputationTargetSpecification,
    ) -> Option<BlacklistRule> {
        let window = self.window();
        let key = self.rule_for(function_id, parameters, target);
        let tripped = {
            let mut history = self.history.entry(key.clone()).or_default();
            history.consecutive += 1;
            if window > 0 {
                history.recent.push_back(true);
                while history.recent.len() > window {
                    history.recent.pop_front();
                }
            }

            let consecutive_tripped = self
                .policy
                .consecutive_failures
                .is_some_and(|limit| history.consecutive >= limit);
            let rate_tripped = self.policy.failure_rate.as_ref().is_some_and(|rate| {
                history.recent.len() >= rate.window && {
                    let failures = history.recent.iter().filter(|failed| **failed).count();
                    failures as f64 / history.recent.len() as f64 >= rate.threshold
                }
            });
            consecutive_tripped || rate_tripped
        };
        if !tripped {
            return None;
        }

        self.history.remove(&key);
        let added = match self.policy.rule_ttl() {
            Some(ttl) => self.blacklist.add_rules_with_ttl([key.clone()], ttl),
            None => self.blacklist.add_rules([key.clone()]),
        };
        if added {
            info!("Blacklisted {function_id} after repeated failures: {key:?}");
            Some(key)
        } else {
            None
        }
    }
}
