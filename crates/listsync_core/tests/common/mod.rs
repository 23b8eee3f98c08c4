//! In-memory source collaborator and engine fixtures shared by sync tests.
#![allow(dead_code)]

use listsync_core::config::SideConfig;
use listsync_core::sync::retry::Sleeper;
use listsync_core::{
    open_db_in_memory, Clock, DeleteCapability, DeleteOutcome, ItemPatch, ManualClock,
    RemoteItem, SourceCollaborator, SourceError, SourceErrorKind, SourceResult, StopHandle,
    SyncConfig, SyncEngine,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const START_MS: i64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List,
    Create { display_name: String, checked: bool },
    Update { id: String, patch: ItemPatch },
    Delete { id: String },
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::List)
    }
}

#[derive(Default)]
struct FakeState {
    items: Vec<RemoteItem>,
    next_id: u64,
    calls: Vec<Call>,
    list_failure: Option<SourceErrorKind>,
    create_failures: HashMap<String, SourceErrorKind>,
    update_failures: HashMap<String, SourceErrorKind>,
    list_delay: Duration,
    create_delay: Duration,
    stop_after_creates: Option<(StopHandle, usize)>,
    creates: usize,
}

/// Scriptable list source. Item ids are issued as `<source_id>-<n>`.
pub struct FakeSource {
    source_id: String,
    capability: DeleteCapability,
    native_clock: Option<ManualClock>,
    state: Mutex<FakeState>,
}

impl FakeSource {
    pub fn new(source_id: &str, capability: DeleteCapability) -> Arc<Self> {
        Arc::new(Self {
            source_id: source_id.to_string(),
            capability,
            native_clock: None,
            state: Mutex::new(FakeState::default()),
        })
    }

    /// Source that reports native modification times read from `clock`.
    pub fn with_native_times(
        source_id: &str,
        capability: DeleteCapability,
        clock: &ManualClock,
    ) -> Arc<Self> {
        Arc::new(Self {
            source_id: source_id.to_string(),
            capability,
            native_clock: Some(clock.clone()),
            state: Mutex::new(FakeState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn stamp(&self, item: &mut RemoteItem) {
        item.native_modified_at = self.native_clock.as_ref().map(Clock::now_ms);
    }

    /// User-side insert, bypassing call recording.
    pub fn insert(&self, id: &str, display_name: &str, checked: bool) {
        let mut item = RemoteItem::new(id, display_name, checked);
        self.stamp(&mut item);
        self.state().items.push(item);
    }

    /// User-side edit, bypassing call recording.
    pub fn edit(&self, id: &str, display_name: Option<&str>, checked: Option<bool>) {
        let native = self.native_clock.as_ref().map(Clock::now_ms);
        let mut state = self.state();
        let item = state
            .items
            .iter_mut()
            .find(|item| item.source_local_id == id)
            .unwrap();
        if let Some(name) = display_name {
            item.display_name = name.to_string();
        }
        if let Some(checked) = checked {
            item.checked = checked;
        }
        item.native_modified_at = native;
    }

    /// User-side removal, bypassing call recording.
    pub fn remove(&self, id: &str) {
        self.state().items.retain(|item| item.source_local_id != id);
    }

    pub fn items(&self) -> Vec<RemoteItem> {
        self.state().items.clone()
    }

    pub fn get(&self, id: &str) -> Option<RemoteItem> {
        self.state()
            .items
            .iter()
            .find(|item| item.source_local_id == id)
            .cloned()
    }

    pub fn find_by_name(&self, display_name: &str) -> Vec<RemoteItem> {
        self.state()
            .items
            .iter()
            .filter(|item| item.display_name == display_name)
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.state().calls.iter().filter(|call| call.is_mutation()).count()
    }

    pub fn list_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| matches!(call, Call::List))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn fail_list(&self, kind: Option<SourceErrorKind>) {
        self.state().list_failure = kind;
    }

    pub fn fail_create_named(&self, display_name: &str, kind: SourceErrorKind) {
        self.state()
            .create_failures
            .insert(display_name.to_string(), kind);
    }

    pub fn fail_update(&self, id: &str, kind: SourceErrorKind) {
        self.state().update_failures.insert(id.to_string(), kind);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.list_failure = None;
        state.create_failures.clear();
        state.update_failures.clear();
    }

    pub fn set_list_delay(&self, delay: Duration) {
        self.state().list_delay = delay;
    }

    /// Delays each create after it is recorded and before the item lands.
    pub fn set_create_delay(&self, delay: Duration) {
        self.state().create_delay = delay;
    }

    /// Requests a stop on `handle` once `creates` items have been created.
    pub fn stop_after_creates(&self, handle: StopHandle, creates: usize) {
        self.state().stop_after_creates = Some((handle, creates));
    }

    fn error(&self, kind: SourceErrorKind, message: &str) -> SourceError {
        SourceError::new(self.source_id.as_str(), kind, message)
    }
}

impl SourceCollaborator for FakeSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn delete_capability(&self) -> DeleteCapability {
        self.capability
    }

    fn list_items(&self, _list_ref: &str) -> SourceResult<Vec<RemoteItem>> {
        let (delay, failure) = {
            let mut state = self.state();
            state.calls.push(Call::List);
            (state.list_delay, state.list_failure)
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(kind) = failure {
            return Err(self.error(kind, "list failed"));
        }
        Ok(self.items())
    }

    fn create_item(
        &self,
        _list_ref: &str,
        display_name: &str,
        checked: bool,
    ) -> SourceResult<String> {
        let native = self.native_clock.as_ref().map(Clock::now_ms);
        let delay = {
            let mut state = self.state();
            state.calls.push(Call::Create {
                display_name: display_name.to_string(),
                checked,
            });
            if let Some(kind) = state.create_failures.get(display_name).copied() {
                return Err(self.error(kind, "create refused"));
            }
            state.create_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.state();

        state.next_id += 1;
        let id = format!("{}-{}", self.source_id, state.next_id);
        let mut item = RemoteItem::new(id.as_str(), display_name, checked);
        item.native_modified_at = native;
        state.items.push(item);

        state.creates += 1;
        if let Some((handle, limit)) = &state.stop_after_creates {
            if state.creates >= *limit {
                handle.request_stop();
            }
        }
        Ok(id)
    }

    fn update_item(&self, source_local_id: &str, patch: &ItemPatch) -> SourceResult<()> {
        let native = self.native_clock.as_ref().map(Clock::now_ms);
        let mut state = self.state();
        state.calls.push(Call::Update {
            id: source_local_id.to_string(),
            patch: patch.clone(),
        });
        if let Some(kind) = state.update_failures.get(source_local_id).copied() {
            return Err(self.error(kind, "update refused"));
        }

        let Some(item) = state
            .items
            .iter_mut()
            .find(|item| item.source_local_id == source_local_id)
        else {
            return Err(self.error(SourceErrorKind::Rejected, "no such item"));
        };
        if let Some(name) = &patch.display_name {
            item.display_name = name.clone();
        }
        if let Some(checked) = patch.checked {
            item.checked = checked;
        }
        item.native_modified_at = native;
        Ok(())
    }

    fn delete_item(&self, source_local_id: &str) -> SourceResult<DeleteOutcome> {
        let mut state = self.state();
        state.calls.push(Call::Delete {
            id: source_local_id.to_string(),
        });
        if self.capability == DeleteCapability::Unsupported {
            return Ok(DeleteOutcome::Unsupported);
        }
        let before = state.items.len();
        state
            .items
            .retain(|item| item.source_local_id != source_local_id);
        if state.items.len() == before {
            return Err(self.error(SourceErrorKind::Rejected, "no such item"));
        }
        Ok(DeleteOutcome::Deleted)
    }
}

pub fn config() -> SyncConfig {
    let mut config = SyncConfig::new(
        SideConfig {
            source_id: "alpha".to_string(),
            list_ref: "groceries".to_string(),
        },
        SideConfig {
            source_id: "beta".to_string(),
            list_ref: "shopping".to_string(),
        },
    );
    config.retry.initial_backoff_ms = 10;
    config.retry.max_backoff_ms = 100;
    config.retry.call_timeout_ms = 2_000;
    config
}

pub fn no_sleep() -> Sleeper {
    Arc::new(|_| {})
}

pub fn engine_with(
    config: SyncConfig,
    a: &Arc<FakeSource>,
    b: &Arc<FakeSource>,
    clock: &ManualClock,
) -> SyncEngine {
    SyncEngine::new(config, open_db_in_memory().unwrap(), a.clone(), b.clone())
        .unwrap()
        .with_clock(Arc::new(clock.clone()))
        .with_sleeper(no_sleep())
}

pub fn engine(a: &Arc<FakeSource>, b: &Arc<FakeSource>, clock: &ManualClock) -> SyncEngine {
    engine_with(config(), a, b, clock)
}
