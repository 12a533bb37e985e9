//! Pending-callback registry for one conversational session.
//!
//! The dialog engine registers a callback whenever it hands work to an
//! external party and later resolves it exactly once: by success, failure,
//! or timeout. Records whose deadline has passed are swept by [`Behaviors::expire`]
//! without running any action.

use std::collections::HashMap;
#[cfg(any(test, feature = "test-util"))]
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use recall_contracts::{empty_payload, ActionParams, CallbackRecord, RawCallbacks, Resolution};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Grace period in seconds added to every computed deadline.
pub const EXPIRATION_DELAY: i64 = 1;

pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

pub type BehaviorCatalog = HashMap<String, Arc<dyn BehaviorDescriptor>>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("behavior not found in catalog: {0}")]
    BehaviorNotFound(String),
    #[error("callback not found: {0}")]
    CallbackNotFound(String),
    #[error("no saved callback for behavior: {0}")]
    SavedBehaviorNotFound(String),
    #[error("{resolution} action for callback {callback_id} failed: {source}")]
    Action {
        callback_id: String,
        resolution: Resolution,
        #[source]
        source: ActionError,
    },
    #[error("deadline for behavior {behavior_id} overflows: now {now} + timeout {timeout} + delay {delay}")]
    DeadlineOverflow {
        behavior_id: String,
        now: i64,
        timeout: i64,
        delay: i64,
    },
    #[error("snapshot digest failed: {0}")]
    Digest(String),
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::BehaviorNotFound(_)
                | RegistryError::CallbackNotFound(_)
                | RegistryError::SavedBehaviorNotFound(_)
        )
    }
}

/// The slice of session state the registry and its actions may read.
pub trait SessionContext {
    fn session_id(&self) -> &str;

    /// Name of the scenario currently driving the conversation, if any.
    fn last_scenario_name(&self) -> Option<&str>;
}

pub trait Action: Send + Sync {
    fn run(
        &self,
        session: &dyn SessionContext,
        text_preprocessing_result: &Value,
        action_params: &ActionParams,
    ) -> Result<(), ActionError>;
}

pub trait BehaviorDescriptor: Send + Sync {
    /// Seconds to wait for the callback, before the grace delay.
    fn timeout(&self, action_params: Option<&ActionParams>) -> i64;

    fn success_action(&self) -> &dyn Action;

    fn fail_action(&self) -> &dyn Action;

    fn timeout_action(&self) -> &dyn Action;

    fn action(&self, resolution: Resolution) -> &dyn Action {
        match resolution {
            Resolution::Success => self.success_action(),
            Resolution::Fail => self.fail_action(),
            Resolution::Timeout => self.timeout_action(),
        }
    }
}

pub trait Clock: Send + Sync {
    fn now_secs(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Clock that only moves when told to.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

#[cfg(any(test, feature = "test-util"))]
impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Clock for ManualClock {
    fn now_secs(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedCallback {
    pub callback_id: String,
    pub behavior_id: String,
    pub resolution: Resolution,
}

pub struct Behaviors {
    callbacks: RawCallbacks,
    catalog: Arc<BehaviorCatalog>,
    clock: Arc<dyn Clock>,
    expiration_delay: i64,
    returned: Vec<ReturnedCallback>,
}

impl Behaviors {
    pub fn new(raw: RawCallbacks, catalog: Arc<BehaviorCatalog>) -> Self {
        Self {
            callbacks: raw,
            catalog,
            clock: Arc::new(SystemClock),
            expiration_delay: EXPIRATION_DELAY,
            returned: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_expiration_delay(mut self, secs: i64) -> Self {
        self.expiration_delay = secs;
        self
    }

    pub fn expiration_delay(&self) -> i64 {
        self.expiration_delay
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Registers a pending callback, replacing any record under the same id.
    pub fn add(
        &mut self,
        callback_id: &str,
        behavior_id: &str,
        scenario_id: Option<&str>,
        text_preprocessing_result: Option<Value>,
        action_params: Option<ActionParams>,
    ) -> Result<(), RegistryError> {
        let descriptor = self.descriptor(behavior_id)?;
        let now = self.clock.now_secs();
        let timeout = descriptor.timeout(action_params.as_ref());
        let expire_time = now
            .checked_add(timeout)
            .and_then(|v| v.checked_add(self.expiration_delay))
            .ok_or_else(|| RegistryError::DeadlineOverflow {
                behavior_id: behavior_id.to_string(),
                now,
                timeout,
                delay: self.expiration_delay,
            })?;

        let record = CallbackRecord {
            behavior_id: behavior_id.to_string(),
            expire_time,
            scenario_id: scenario_id.map(str::to_string),
            text_preprocessing_result: text_preprocessing_result.unwrap_or_else(empty_payload),
            action_params,
        };
        if self
            .callbacks
            .insert(callback_id.to_string(), record)
            .is_some()
        {
            debug!(callback_id, behavior_id, "replaced pending callback");
        }
        info!(
            callback_id,
            behavior_id,
            scenario_id = scenario_id.unwrap_or(""),
            expire_time,
            "callback added"
        );
        Ok(())
    }

    pub fn success(
        &mut self,
        callback_id: &str,
        session: &dyn SessionContext,
    ) -> Result<bool, RegistryError> {
        self.resolve(callback_id, Resolution::Success, session)
    }

    pub fn fail(
        &mut self,
        callback_id: &str,
        session: &dyn SessionContext,
    ) -> Result<bool, RegistryError> {
        self.resolve(callback_id, Resolution::Fail, session)
    }

    pub fn timeout(
        &mut self,
        callback_id: &str,
        session: &dyn SessionContext,
    ) -> Result<bool, RegistryError> {
        self.resolve(callback_id, Resolution::Timeout, session)
    }

    /// Runs the action for `resolution` once and drops the record.
    ///
    /// Returns `Ok(false)` when the id is unknown. The record is removed before
    /// the action runs, so a failing action is never retried by a repeat call.
    pub fn resolve(
        &mut self,
        callback_id: &str,
        resolution: Resolution,
        session: &dyn SessionContext,
    ) -> Result<bool, RegistryError> {
        let Some(record) = self.callbacks.remove(callback_id) else {
            debug!(
                callback_id,
                resolution = resolution.as_str(),
                "callback not registered, nothing to resolve"
            );
            return Ok(false);
        };

        self.returned.push(ReturnedCallback {
            callback_id: callback_id.to_string(),
            behavior_id: record.behavior_id.clone(),
            resolution,
        });

        let descriptor = match self.descriptor(&record.behavior_id) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(
                    callback_id,
                    behavior_id = %record.behavior_id,
                    "dropping callback with unknown behavior"
                );
                return Err(err);
            }
        };

        info!(
            callback_id,
            behavior_id = %record.behavior_id,
            resolution = resolution.as_str(),
            "callback resolved"
        );
        let params = record.params_or_empty();
        descriptor
            .action(resolution)
            .run(session, &record.text_preprocessing_result, &params)
            .map_err(|source| RegistryError::Action {
                callback_id: callback_id.to_string(),
                resolution,
                source,
            })?;
        Ok(true)
    }

    /// Drops every record whose deadline is strictly before now. Runs no actions.
    pub fn expire(&mut self) -> Vec<String> {
        let now = self.clock.now_secs();
        let expired: Vec<String> = self
            .callbacks
            .iter()
            .filter(|(_, record)| record.expire_time < now)
            .map(|(id, _)| id.clone())
            .collect();
        for callback_id in &expired {
            if let Some(record) = self.callbacks.remove(callback_id) {
                info!(
                    callback_id = %callback_id,
                    behavior_id = %record.behavior_id,
                    expire_time = record.expire_time,
                    now,
                    "callback expired"
                );
            }
        }
        expired
    }

    /// True when the saved callback for `behavior_id` was issued outside any scenario.
    pub fn check_got_saved_id(&self, behavior_id: &str) -> Result<bool, RegistryError> {
        self.callbacks
            .values()
            .find(|record| record.behavior_id == behavior_id)
            .map(|record| record.scenario_id.is_none())
            .ok_or_else(|| RegistryError::SavedBehaviorNotFound(behavior_id.to_string()))
    }

    /// True when the conversation has moved away from the callback's scenario.
    pub fn check_misstate(
        &self,
        callback_id: &str,
        session: &dyn SessionContext,
    ) -> Result<bool, RegistryError> {
        let record = self
            .callbacks
            .get(callback_id)
            .ok_or_else(|| RegistryError::CallbackNotFound(callback_id.to_string()))?;
        let current = session.last_scenario_name();
        let misstate = record.scenario_id.as_deref() != current;
        if misstate {
            debug!(
                callback_id,
                saved_scenario = record.scenario_id.as_deref().unwrap_or(""),
                current_scenario = current.unwrap_or(""),
                "callback misstate"
            );
        }
        Ok(misstate)
    }

    pub fn has_callback(&self, callback_id: &str) -> bool {
        self.callbacks.contains_key(callback_id)
    }

    pub fn get_callback_action_params(&self, callback_id: &str) -> Option<ActionParams> {
        self.callbacks
            .get(callback_id)
            .map(CallbackRecord::params_or_empty)
    }

    /// Callbacks resolved through this registry, in resolution order.
    pub fn returned_callbacks(&self) -> &[ReturnedCallback] {
        &self.returned
    }

    pub fn raw(&self) -> RawCallbacks {
        self.callbacks
            .iter()
            .map(|(id, record)| (id.clone(), record.normalized()))
            .collect()
    }

    /// SHA-256 over the JCS form of [`Behaviors::raw`].
    pub fn snapshot_digest(&self) -> Result<String, RegistryError> {
        snapshot_digest(&self.raw())
    }

    fn descriptor(&self, behavior_id: &str) -> Result<Arc<dyn BehaviorDescriptor>, RegistryError> {
        self.catalog
            .get(behavior_id)
            .cloned()
            .ok_or_else(|| RegistryError::BehaviorNotFound(behavior_id.to_string()))
    }
}

pub fn snapshot_digest(raw: &RawCallbacks) -> Result<String, RegistryError> {
    let canonical = serde_jcs::to_string(raw)
        .map_err(|err| RegistryError::Digest(format!("failed to canonicalize JSON via JCS: {err}")))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
