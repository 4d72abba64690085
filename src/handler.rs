// this_file: src/handler.rs

//! The font editing session core.
//!
//! A [`FontHandler`] is bound to one backend and mediates every client
//! operation on it: cached reads, edit application, change broadcasting,
//! asynchronous persistence and reconciliation of changes made behind the
//! server's back.
//!
//! All font state (cache, dependency tracker, write queue) lives behind a
//! single async mutex held across backend calls, so operations are
//! serialized exactly like a single-task event loop. The session table
//! (connections and subscriptions) sits behind a plain mutex and is never
//! held across a suspension point.

use crate::backend::{BackendFeatures, BackendInfo, ExternalEvent, ReadBackend};
use crate::cache::{CachedValue, DataKey, LocalCache, RootKey, DEFAULT_CACHE_CAPACITY};
use crate::changes::{
    apply_change_observed, collect_change_paths, filter_change_pattern, match_change_pattern,
    Change, ChangeObserver,
};
use crate::connection::{Connection, SessionTable};
use crate::dependencies::DependencyTracker;
use crate::error::{Error, Result};
use crate::font::{CustomData, FontAxis, GlyphMap, VariableGlyph};
use crate::logging::WriteTimer;
use crate::pattern::{PathElement, PathOrPattern, Pattern};
use crate::tasks;
use futures::future::BoxFuture;
use futures::StreamExt;
use indexmap::IndexMap;
use log::{error, info};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Async callback invoked after the last connection leaves.
pub type ConnectionsClosedCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Construction options for a [`FontHandler`].
#[derive(Clone, Default)]
pub struct HandlerOptions {
    /// Refuse to schedule backend writes, regardless of capabilities.
    pub read_only: bool,
    /// Allow editing in read-only mode without persisting (demo setups).
    pub dummy_editor: bool,
    /// Cache capacity in entries; defaults to [`DEFAULT_CACHE_CAPACITY`].
    pub cache_capacity: Option<usize>,
    /// Invoked exactly once each time the connection set empties.
    pub all_connections_closed: Option<ConnectionsClosedCallback>,
}

type WriteFunc = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct PendingWrite {
    write: WriteFunc,
    connection: Option<Connection>,
}

struct FontState {
    cache: LocalCache,
    dependencies: DependencyTracker,
    /// `None` once the write task has terminated; writes can no longer be
    /// scheduled.
    write_queue: Option<IndexMap<DataKey, PendingWrite>>,
    write_error: Option<String>,
}

#[derive(Default)]
struct TaskHandles {
    writer: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

/// Server-side session over one font backend.
pub struct FontHandler {
    backend: Arc<dyn ReadBackend>,
    read_only: bool,
    dummy_editor: bool,
    all_connections_closed: Option<ConnectionsClosedCallback>,
    sessions: StdMutex<SessionTable>,
    state: Mutex<FontState>,
    /// Set while the write queue has entries to process.
    work_available: watch::Sender<bool>,
    /// Set while no write is pending or in flight.
    writing_idle: watch::Sender<bool>,
    tasks: StdMutex<TaskHandles>,
}

impl FontHandler {
    /// Create a handler over `backend`.
    ///
    /// A backend without the writable capability forces read-only mode.
    pub fn new(backend: Arc<dyn ReadBackend>, options: HandlerOptions) -> Arc<FontHandler> {
        let read_only = options.read_only || backend.writable().is_none();
        let (work_available, _) = watch::channel(false);
        let (writing_idle, _) = watch::channel(true);
        Arc::new(FontHandler {
            backend,
            read_only,
            dummy_editor: options.dummy_editor,
            all_connections_closed: options.all_connections_closed,
            sessions: StdMutex::new(SessionTable::default()),
            state: Mutex::new(FontState {
                cache: LocalCache::new(
                    options.cache_capacity.unwrap_or(DEFAULT_CACHE_CAPACITY),
                ),
                dependencies: DependencyTracker::new(),
                write_queue: Some(IndexMap::new()),
                write_error: None,
            }),
            work_available,
            writing_idle,
            tasks: StdMutex::new(TaskHandles::default()),
        })
    }

    /// Launch the background tasks: the write scheduler and, when the
    /// backend is watchable, the external-change watcher.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("task handle mutex poisoned");
        if tasks.writer.is_none() {
            tasks.writer = Some(tokio::spawn(Arc::clone(self).process_writes()));
        }
        if tasks.watcher.is_none() && self.backend.watchable().is_some() {
            tasks.watcher = Some(tokio::spawn(Arc::clone(self).process_external_changes()));
        }
    }

    /// Close the backend and stop the background tasks, draining scheduled
    /// writes first. A scheduler failure surfaces here.
    pub async fn close(&self) -> Result<()> {
        self.backend.close();
        let (watcher, writer) = {
            let mut tasks = self.tasks.lock().expect("task handle mutex poisoned");
            (tasks.watcher.take(), tasks.writer.take())
        };
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        let drained = match &writer {
            Some(_) => self.finish_writing().await,
            None => Ok(()),
        };
        if let Some(writer) = writer {
            writer.abort();
        }
        drained
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Register `connection` for the lifetime of the returned guard.
    ///
    /// Dropping the guard removes the connection again; when the last one
    /// leaves, the configured callback fires exactly once.
    pub fn use_connection(self: &Arc<Self>, connection: Connection) -> ConnectionGuard {
        self.sessions
            .lock()
            .expect("session table mutex poisoned")
            .add(connection.clone());
        ConnectionGuard {
            handler: Arc::clone(self),
            connection,
        }
    }

    // ------------------------------------------------------------------
    // Remote methods
    // ------------------------------------------------------------------

    /// Whether clients must treat the font as read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only && !self.dummy_editor
    }

    /// Backend name and feature flags.
    pub fn get_backend_info(&self) -> BackendInfo {
        BackendInfo {
            name: self.backend.name().to_string(),
            features: BackendFeatures {
                glyphs_used_by: self.backend.glyph_usage().is_some(),
            },
        }
    }

    /// Cached glyph load. Backend misses are cached too.
    pub async fn get_glyph(&self, glyph_name: &str) -> Result<Option<VariableGlyph>> {
        let mut state = self.state.lock().await;
        self.get_glyph_locked(&mut state, glyph_name).await
    }

    /// Cached axes load.
    pub async fn get_global_axes(&self) -> Result<Vec<FontAxis>> {
        let mut state = self.state.lock().await;
        self.get_root_locked(&mut state, RootKey::Axes)
            .await?
            .into_axes()
    }

    /// Cached glyph map load.
    pub async fn get_glyph_map(&self) -> Result<GlyphMap> {
        let mut state = self.state.lock().await;
        self.get_root_locked(&mut state, RootKey::GlyphMap)
            .await?
            .into_glyph_map()
    }

    /// Cached custom data load.
    pub async fn get_custom_data(&self) -> Result<CustomData> {
        let mut state = self.state.lock().await;
        self.get_root_locked(&mut state, RootKey::CustomData)
            .await?
            .into_custom_data()
    }

    /// Cached units-per-em load.
    pub async fn get_units_per_em(&self) -> Result<u32> {
        let mut state = self.state.lock().await;
        self.get_root_locked(&mut state, RootKey::UnitsPerEm)
            .await?
            .into_units_per_em()
    }

    /// Delegate to the backend's native glyphs-used-by query when it has
    /// one; an empty list otherwise.
    pub async fn get_glyphs_used_by(&self, glyph_name: &str) -> Result<Vec<String>> {
        match self.backend.glyph_usage() {
            Some(usage) => usage.get_glyphs_used_by(glyph_name).await,
            None => Ok(Vec::new()),
        }
    }

    /// Components `glyph_name` references, per the local tracker.
    pub async fn glyph_made_of(&self, glyph_name: &str) -> Vec<String> {
        self.state.lock().await.dependencies.made_of(glyph_name)
    }

    /// Glyphs referencing `glyph_name`, per the local tracker.
    pub async fn glyph_used_by(&self, glyph_name: &str) -> Vec<String> {
        self.state.lock().await.dependencies.used_by(glyph_name)
    }

    /// Widen one subscription tier of `connection` by `path_or_pattern`.
    pub fn subscribe_changes(
        &self,
        path_or_pattern: PathOrPattern,
        want_live_changes: bool,
        connection: &Connection,
    ) {
        self.adjust_subscription(path_or_pattern, want_live_changes, connection, Pattern::union);
    }

    /// Narrow one subscription tier of `connection` by `path_or_pattern`.
    pub fn unsubscribe_changes(
        &self,
        path_or_pattern: PathOrPattern,
        want_live_changes: bool,
        connection: &Connection,
    ) {
        self.adjust_subscription(
            path_or_pattern,
            want_live_changes,
            connection,
            Pattern::difference,
        );
    }

    fn adjust_subscription(
        &self,
        path_or_pattern: PathOrPattern,
        want_live_changes: bool,
        connection: &Connection,
        merge: fn(&Pattern, &Pattern) -> Pattern,
    ) {
        let pattern = path_or_pattern.into_pattern();
        let mut sessions = self.sessions.lock().expect("session table mutex poisoned");
        let tier = sessions
            .subscriptions_mut(&connection.client_uuid)
            .tier_mut(want_live_changes);
        *tier = merge(tier, &pattern);
    }

    /// Broadcast an in-progress edit on the live tier. Does not touch the
    /// cache and schedules no writes.
    pub fn edit_incremental(&self, live_change: &Change, connection: &Connection) {
        self.broadcast_change(live_change, Some(connection), true);
    }

    /// Commit an edit: apply to the cache, schedule persistence, and, when
    /// `broadcast` is set, notify committed-tier subscribers.
    pub async fn edit_final(
        &self,
        final_change: Change,
        _rollback_change: Option<Change>,
        _edit_label: &str,
        broadcast: bool,
        connection: &Connection,
    ) -> Result<()> {
        // TODO: record _rollback_change and _edit_label once server-side
        // history lands
        self.update_local_data_and_write(&final_change, Some(connection), false)
            .await?;
        if broadcast {
            self.broadcast_change(&final_change, Some(connection), false);
        }
        Ok(())
    }

    /// Commit a server-initiated edit with no originating client.
    ///
    /// Persistence failures of such writes cannot be reported to anyone;
    /// they stop the write scheduler and surface through
    /// [`FontHandler::finish_writing`] and [`FontHandler::persistence_error`].
    pub async fn edit_server(&self, change: Change) -> Result<()> {
        self.update_local_data_and_write(&change, None, false)
            .await?;
        self.broadcast_change(&change, None, false);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Broadcast engine
    // ------------------------------------------------------------------

    /// Dispatch `change` to every subscribed connection except `source`.
    ///
    /// Live changes consult the live tier only; committed changes consult
    /// both tiers. Dispatches are fire-and-forget: initiated before this
    /// returns, delivered at each peer's pace.
    fn broadcast_change(&self, change: &Change, source: Option<&Connection>, is_live: bool) {
        let targets: Vec<Connection> = {
            let sessions = self.sessions.lock().expect("session table mutex poisoned");
            sessions
                .connections()
                .iter()
                .filter(|connection| {
                    source.map_or(true, |source| {
                        source.client_uuid != connection.client_uuid
                    })
                })
                .filter(|connection| {
                    sessions
                        .subscriptions(&connection.client_uuid)
                        .map_or(false, |subs| {
                            let mut tiers = vec![subs.tier(true)];
                            if !is_live {
                                tiers.push(subs.tier(false));
                            }
                            tiers
                                .into_iter()
                                .any(|pattern| match_change_pattern(change, pattern))
                        })
                })
                .cloned()
                .collect()
        };
        for connection in targets {
            let change = change.clone();
            tasks::spawn_logged("change broadcast", async move {
                connection.proxy.external_change(&change, is_live).await
            });
        }
    }

    // ------------------------------------------------------------------
    // Cached loads
    // ------------------------------------------------------------------

    async fn get_glyph_locked(
        &self,
        state: &mut FontState,
        glyph_name: &str,
    ) -> Result<Option<VariableGlyph>> {
        let key = DataKey::glyph(glyph_name);
        if let Some(value) = state.cache.get(&key) {
            return Ok(value.as_glyph()?.cloned());
        }
        let glyph = self.backend.get_glyph(glyph_name).await?;
        if let Some(glyph) = &glyph {
            state.dependencies.update_glyph(glyph_name, Some(glyph));
        }
        state.cache.insert(key, CachedValue::Glyph(glyph.clone()));
        Ok(glyph)
    }

    async fn get_root_locked(&self, state: &mut FontState, root: RootKey) -> Result<CachedValue> {
        let key = DataKey::Root(root);
        if let Some(value) = state.cache.get(&key) {
            return Ok(value.clone());
        }
        let value = match root {
            RootKey::Axes => CachedValue::Axes(self.backend.get_global_axes().await?),
            RootKey::GlyphMap => CachedValue::GlyphMap(self.backend.get_glyph_map().await?),
            RootKey::CustomData => {
                CachedValue::CustomData(self.backend.get_custom_data().await?)
            }
            RootKey::UnitsPerEm => {
                CachedValue::UnitsPerEm(self.backend.get_units_per_em().await?)
            }
        };
        state.cache.insert(key, value.clone());
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Edit pipeline
    // ------------------------------------------------------------------

    /// Apply `change` locally and, for non-external non-read-only edits,
    /// schedule the matching backend writes.
    ///
    /// External changes are first restricted to the locally cached subset;
    /// the restricted change actually applied is returned (`None` when the
    /// restriction is empty and nothing happened).
    async fn update_local_data_and_write(
        &self,
        change: &Change,
        source: Option<&Connection>,
        external: bool,
    ) -> Result<Option<Change>> {
        let mut state = self.state.lock().await;

        let change = if external {
            let local_pattern = state.cache.local_data_pattern();
            match filter_change_pattern(change, &local_pattern) {
                Some(filtered) => filtered,
                None => return Ok(None),
            }
        } else {
            change.clone()
        };

        // Sparse root assembly: only the touched parts of the font.
        let root_keys = touched_root_keys(&change)?;
        let mut assembly = FontAssembly::new();
        for root_key in &root_keys {
            if root_key == "glyphs" {
                for glyph_name in touched_glyph_names(&change) {
                    let glyph = self.get_glyph_locked(&mut state, &glyph_name).await?;
                    assembly.attach_glyph(&glyph_name, serde_json::to_value(&glyph)?);
                }
            } else {
                let root = RootKey::from_name(root_key)
                    .ok_or_else(|| Error::UnknownKey(root_key.clone()))?;
                let value = self.get_root_locked(&mut state, root).await?;
                assembly.attach_root(root_key, value.to_value()?);
            }
        }

        assembly.apply(&change)?;

        // Commit: originally touched roots first, then assigned roots in
        // sorted order.
        let write_to_backend = !external && !self.read_only;
        let mut commit_order = root_keys.clone();
        for assigned in assembly.assigned_roots() {
            if !commit_order.contains(&assigned) {
                commit_order.push(assigned);
            }
        }
        let mut dead_writes: Vec<DataKey> = Vec::new();
        for root_key in &commit_order {
            if root_key == "glyphs" {
                let glyph_map = self
                    .get_root_locked(&mut state, RootKey::GlyphMap)
                    .await?
                    .into_glyph_map()?;
                for glyph_name in assembly.glyph_names() {
                    let key = DataKey::glyph(&glyph_name);
                    let value = assembly
                        .glyph_value(&glyph_name)
                        .cloned()
                        .unwrap_or(Value::Null);
                    let cached = CachedValue::glyph_from_value(value)?;
                    state
                        .dependencies
                        .update_glyph(&glyph_name, cached.as_glyph()?);
                    state.cache.insert(key.clone(), cached.clone());
                    if !write_to_backend {
                        continue;
                    }
                    let Some(glyph) = cached.as_glyph()?.cloned() else {
                        continue;
                    };
                    let codepoints = glyph_map.get(&glyph_name).cloned().unwrap_or_default();
                    let write = self.glyph_write_func(&glyph_name, glyph, codepoints);
                    if let Some(dead) =
                        self.schedule_data_write(&mut state, key, write, source)
                    {
                        dead_writes.push(dead);
                    }
                }
                for glyph_name in assembly.deleted_glyph_names() {
                    let key = DataKey::glyph(&glyph_name);
                    state.cache.remove(&key);
                    state.dependencies.update_glyph(&glyph_name, None);
                    if !write_to_backend {
                        continue;
                    }
                    let write = self.glyph_delete_func(&glyph_name);
                    if let Some(dead) =
                        self.schedule_data_write(&mut state, key, write, source)
                    {
                        dead_writes.push(dead);
                    }
                }
            } else {
                let root = RootKey::from_name(root_key)
                    .ok_or_else(|| Error::UnknownKey(root_key.clone()))?;
                let Some(value) = assembly.root_value(root_key).cloned() else {
                    continue;
                };
                let key = DataKey::Root(root);
                let cached = CachedValue::from_root_value(root, value)?;
                state.cache.insert(key.clone(), cached.clone());
                if !write_to_backend {
                    continue;
                }
                let write = self.root_write_func(root, cached);
                if let Some(dead) = self.schedule_data_write(&mut state, key, write, source) {
                    dead_writes.push(dead);
                }
            }
        }
        drop(state);

        for key in dead_writes {
            self.report_scheduler_stopped(key, source).await;
        }
        Ok(Some(change))
    }

    fn glyph_write_func(
        &self,
        glyph_name: &str,
        glyph: VariableGlyph,
        codepoints: Vec<u32>,
    ) -> WriteFunc {
        let backend = Arc::clone(&self.backend);
        let glyph_name = glyph_name.to_string();
        Box::new(move || {
            Box::pin(async move {
                let writable = backend
                    .writable()
                    .ok_or_else(|| Error::Backend("backend is not writable".to_string()))?;
                writable.put_glyph(&glyph_name, glyph, codepoints).await
            })
        })
    }

    fn glyph_delete_func(&self, glyph_name: &str) -> WriteFunc {
        let backend = Arc::clone(&self.backend);
        let glyph_name = glyph_name.to_string();
        Box::new(move || {
            Box::pin(async move {
                let writable = backend
                    .writable()
                    .ok_or_else(|| Error::Backend("backend is not writable".to_string()))?;
                writable.delete_glyph(&glyph_name).await
            })
        })
    }

    fn root_write_func(&self, root: RootKey, value: CachedValue) -> WriteFunc {
        let backend = Arc::clone(&self.backend);
        Box::new(move || {
            Box::pin(async move {
                let writable = backend
                    .writable()
                    .ok_or_else(|| Error::Backend("backend is not writable".to_string()))?;
                match (root, value) {
                    (RootKey::Axes, CachedValue::Axes(axes)) => {
                        writable.put_global_axes(axes).await
                    }
                    (RootKey::GlyphMap, CachedValue::GlyphMap(map)) => {
                        writable.put_glyph_map(map).await
                    }
                    (RootKey::CustomData, CachedValue::CustomData(data)) => {
                        writable.put_custom_data(data).await
                    }
                    (RootKey::UnitsPerEm, CachedValue::UnitsPerEm(upm)) => {
                        writable.put_units_per_em(upm).await
                    }
                    (root, _) => Err(Error::UnknownKey(root.name().to_string())),
                }
            })
        })
    }

    // ------------------------------------------------------------------
    // Write scheduler
    // ------------------------------------------------------------------

    /// Enqueue one write, coalescing with any pending write for the same
    /// key. Returns the key when the scheduler is no longer running, in
    /// which case the caller must run the dead-scheduler recovery path
    /// after releasing the state lock.
    fn schedule_data_write(
        &self,
        state: &mut FontState,
        write_key: DataKey,
        write: WriteFunc,
        connection: Option<&Connection>,
    ) -> Option<DataKey> {
        let Some(queue) = state.write_queue.as_mut() else {
            return Some(write_key);
        };
        let should_signal = queue.is_empty();
        queue.insert(
            write_key,
            PendingWrite {
                write,
                connection: connection.cloned(),
            },
        );
        if should_signal {
            self.work_available.send_replace(true);
            self.writing_idle.send_replace(false);
        }
        None
    }

    async fn report_scheduler_stopped(&self, write_key: DataKey, connection: Option<&Connection>) {
        self.reload_data(&write_key.to_pattern()).await;
        if let Some(connection) = connection {
            if let Err(notify_error) = connection
                .proxy
                .message_from_server(
                    "The data could not be saved.",
                    "The edit has been reverted.\n\nThe server can no longer \
                     persist edits, please contact an admin.",
                )
                .await
            {
                error!("failed to notify client about lost write: {}", notify_error);
            }
        }
    }

    async fn process_writes(self: Arc<Self>) {
        let mut work = self.work_available.subscribe();
        loop {
            if work.wait_for(|ready| *ready).await.is_err() {
                break;
            }
            let result = self.process_writes_one_cycle().await;
            let mut state = self.state.lock().await;
            match result {
                Ok(()) => {
                    let drained = state
                        .write_queue
                        .as_ref()
                        .map_or(true, |queue| queue.is_empty());
                    if drained {
                        self.work_available.send_replace(false);
                        self.writing_idle.send_replace(true);
                    }
                    // Not drained: a write arrived while we were between
                    // cycles; go straight into the next one.
                }
                Err(write_error) => {
                    error!("write task failed: {}", write_error);
                    state.write_error = Some(write_error.to_string());
                    state.write_queue = None;
                    self.work_available.send_replace(false);
                    self.writing_idle.send_replace(true);
                    break;
                }
            }
        }
    }

    async fn process_writes_one_cycle(&self) -> Result<()> {
        loop {
            let entry = {
                let mut state = self.state.lock().await;
                match state.write_queue.as_mut() {
                    Some(queue) => queue.shift_remove_index(0),
                    None => None,
                }
            };
            let Some((write_key, pending)) = entry else {
                return Ok(());
            };
            info!("write {} to backend", write_key);
            let result = {
                let _timer = WriteTimer::start(&write_key);
                (pending.write)().await
            };
            if let Err(write_error) = result {
                error!("exception while writing data: {}", write_error);
                self.reload_data(&write_key.to_pattern()).await;
                match &pending.connection {
                    Some(connection) => {
                        if let Err(notify_error) = connection
                            .proxy
                            .message_from_server(
                                "The data could not be saved due to an error.",
                                &format!("The edit has been reverted.\n\n{}", write_error),
                            )
                            .await
                        {
                            error!(
                                "failed to notify client about revert: {}",
                                notify_error
                            );
                        }
                    }
                    // No connection to inform; the failure poisons the
                    // scheduler.
                    None => return Err(write_error),
                }
            }
            tokio::task::yield_now().await;
        }
    }

    /// Wait until all scheduled writes have been written. A failed
    /// scheduler surfaces its stored error, before or after the wait.
    pub async fn finish_writing(&self) -> Result<()> {
        if let Some(message) = self.state.lock().await.write_error.clone() {
            return Err(Error::SchedulerStopped(message));
        }
        let mut idle = self.writing_idle.subscribe();
        let _ = idle.wait_for(|done| *done).await;
        if let Some(message) = self.state.lock().await.write_error.clone() {
            return Err(Error::SchedulerStopped(message));
        }
        Ok(())
    }

    /// The terminal scheduler error, when persistence has failed for good.
    pub async fn persistence_error(&self) -> Option<String> {
        self.state.lock().await.write_error.clone()
    }

    // ------------------------------------------------------------------
    // External changes
    // ------------------------------------------------------------------

    async fn process_external_changes(self: Arc<Self>) {
        let Some(watcher) = self.backend.watchable() else {
            return;
        };
        let mut events = match watcher.watch_external_changes().await {
            Ok(events) => events,
            Err(watch_error) => {
                error!("could not watch external changes: {}", watch_error);
                return;
            }
        };
        while let Some(event) = events.next().await {
            if let Err(event_error) = self.handle_external_event(event).await {
                error!("exception in external changes watcher: {}", event_error);
            }
        }
    }

    async fn handle_external_event(&self, event: ExternalEvent) -> Result<()> {
        if let Some(change) = &event.change {
            // Only apply what we have cached; the backend already holds the
            // changed data, so re-fetching would double-apply.
            if let Some(applied) = self.update_local_data_and_write(change, None, true).await? {
                self.broadcast_change(&applied, None, false);
            }
        }
        if let Some(reload_pattern) = &event.reload_pattern {
            self.reload_data(reload_pattern).await;
        }
        Ok(())
    }

    /// Drop the cache entries selected by `reload_pattern` and tell every
    /// connection whose combined subscription overlaps to re-fetch the
    /// intersection.
    pub async fn reload_data(&self, reload_pattern: &Pattern) {
        {
            let mut state = self.state.lock().await;
            for (root_key, entry) in reload_pattern.entries() {
                if root_key == "glyphs" {
                    match entry {
                        Some(glyphs) => {
                            for (glyph_name, _) in glyphs.entries() {
                                state.cache.remove(&DataKey::glyph(glyph_name));
                            }
                        }
                        None => {
                            let glyph_keys: Vec<DataKey> = state
                                .cache
                                .keys()
                                .filter(|key| matches!(key, DataKey::Glyph(_)))
                                .cloned()
                                .collect();
                            for key in glyph_keys {
                                state.cache.remove(&key);
                            }
                        }
                    }
                } else if let Some(root) = RootKey::from_name(root_key) {
                    state.cache.remove(&DataKey::Root(root));
                }
            }
        }

        let targets: Vec<(Connection, Pattern)> = {
            let sessions = self.sessions.lock().expect("session table mutex poisoned");
            sessions
                .connections()
                .iter()
                .filter_map(|connection| {
                    let subs = sessions.subscriptions(&connection.client_uuid)?;
                    let overlap = subs.combined().intersect(reload_pattern);
                    (!overlap.is_empty()).then(|| (connection.clone(), overlap))
                })
                .collect()
        };
        if targets.is_empty() {
            return;
        }
        info!("broadcasting data reloads to {} clients", targets.len());
        futures::future::join_all(targets.into_iter().map(|(connection, overlap)| async move {
            if let Err(reload_error) = connection.proxy.reload_data(&overlap).await {
                error!("reload notification failed: {}", reload_error);
            }
        }))
        .await;
    }
}

/// RAII registration of one connection; see [`FontHandler::use_connection`].
pub struct ConnectionGuard {
    handler: Arc<FontHandler>,
    connection: Connection,
}

impl ConnectionGuard {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let now_empty = self
            .handler
            .sessions
            .lock()
            .expect("session table mutex poisoned")
            .remove(&self.connection.client_uuid);
        if now_empty {
            if let Some(callback) = &self.handler.all_connections_closed {
                let future = callback();
                tasks::spawn_logged("connections closed callback", async move {
                    future.await;
                    Ok(())
                });
            }
        }
    }
}

// ----------------------------------------------------------------------
// Sparse root assembly
// ----------------------------------------------------------------------

/// Insert/delete bookkeeping for the assembly's glyph mapping.
///
/// `new_keys` and `deleted_keys` stay disjoint: assigning a previously
/// deleted key moves it back to `new_keys`, deleting a fresh key moves it
/// to `deleted_keys`. Assigning over an existing key changes neither.
#[derive(Debug, Default)]
struct GlyphSetTracker {
    new_keys: BTreeSet<String>,
    deleted_keys: BTreeSet<String>,
}

impl GlyphSetTracker {
    fn note_assigned(&mut self, key: &str, existed: bool) {
        if !existed {
            self.new_keys.insert(key.to_string());
            self.deleted_keys.remove(key);
        }
    }

    fn note_deleted(&mut self, key: &str) {
        self.deleted_keys.insert(key.to_string());
        self.new_keys.remove(key);
    }
}

/// The sparse object changes are applied to: only the touched roots are
/// populated. Root assignments and glyph inserts/deletes are recorded on
/// the side while the change runs.
struct FontAssembly {
    root: Value,
    assigned_roots: BTreeSet<String>,
    glyphs: GlyphSetTracker,
}

impl FontAssembly {
    fn new() -> Self {
        FontAssembly {
            root: Value::Object(serde_json::Map::new()),
            assigned_roots: BTreeSet::new(),
            glyphs: GlyphSetTracker::default(),
        }
    }

    fn attach_root(&mut self, root_key: &str, value: Value) {
        self.root_map().insert(root_key.to_string(), value);
    }

    fn attach_glyph(&mut self, glyph_name: &str, value: Value) {
        let glyphs = self
            .root_map()
            .entry("glyphs".to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Value::Object(glyphs) = glyphs {
            glyphs.insert(glyph_name.to_string(), value);
        }
    }

    fn apply(&mut self, change: &Change) -> Result<()> {
        let mut observer = AssemblyObserver {
            assigned_roots: &mut self.assigned_roots,
            glyphs: &mut self.glyphs,
        };
        apply_change_observed(&mut self.root, change, &mut observer)
    }

    fn root_map(&mut self) -> &mut serde_json::Map<String, Value> {
        self.root
            .as_object_mut()
            .expect("assembly root is an object")
    }

    fn root_value(&self, root_key: &str) -> Option<&Value> {
        self.root.as_object().and_then(|map| map.get(root_key))
    }

    /// Current glyph names, sorted.
    fn glyph_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .root_value("glyphs")
            .and_then(Value::as_object)
            .map(|glyphs| glyphs.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn glyph_value(&self, glyph_name: &str) -> Option<&Value> {
        self.root_value("glyphs")
            .and_then(Value::as_object)
            .and_then(|glyphs| glyphs.get(glyph_name))
    }

    /// Glyph names deleted by the change, sorted.
    fn deleted_glyph_names(&self) -> Vec<String> {
        self.glyphs.deleted_keys.iter().cloned().collect()
    }

    /// Root keys the change assigned, sorted.
    fn assigned_roots(&self) -> Vec<String> {
        self.assigned_roots.iter().cloned().collect()
    }
}

struct AssemblyObserver<'a> {
    assigned_roots: &'a mut BTreeSet<String>,
    glyphs: &'a mut GlyphSetTracker,
}

impl ChangeObserver for AssemblyObserver<'_> {
    fn key_assigned(&mut self, parent: &[PathElement], key: &str, existed: bool) {
        if parent.is_empty() {
            self.assigned_roots.insert(key.to_string());
        } else if is_glyphs_parent(parent) {
            self.glyphs.note_assigned(key, existed);
        }
    }

    fn key_deleted(&mut self, parent: &[PathElement], key: &str) {
        if is_glyphs_parent(parent) {
            self.glyphs.note_deleted(key);
        }
    }
}

fn is_glyphs_parent(parent: &[PathElement]) -> bool {
    parent.len() == 1 && parent[0].as_key() == Some("glyphs")
}

/// Root keys touched by `change`, in collection order.
fn touched_root_keys(change: &Change) -> Result<Vec<String>> {
    collect_change_paths(change, 1)
        .into_iter()
        .map(|path| {
            path[0]
                .as_key()
                .map(str::to_string)
                .ok_or_else(|| Error::UnknownKey(path[0].to_string()))
        })
        .collect()
}

/// Glyph names touched by `change`.
fn touched_glyph_names(change: &Change) -> Vec<String> {
    collect_change_paths(change, 2)
        .into_iter()
        .filter(|path| path[0].as_key() == Some("glyphs"))
        .map(|path| path[1].pattern_key())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClientProxy;
    use crate::memory::MemoryBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct NullProxy;

    #[async_trait]
    impl ClientProxy for NullProxy {
        async fn external_change(&self, _change: &Change, _is_live: bool) -> Result<()> {
            Ok(())
        }
        async fn reload_data(&self, _pattern: &Pattern) -> Result<()> {
            Ok(())
        }
        async fn message_from_server(&self, _title: &str, _message: &str) -> Result<()> {
            Ok(())
        }
    }

    fn connection(uuid: &str) -> Connection {
        Connection::new(uuid, Arc::new(NullProxy))
    }

    fn simple_glyph(name: &str, x_advance: f64) -> VariableGlyph {
        let mut layers = BTreeMap::new();
        layers.insert(
            "default".to_string(),
            crate::font::Layer {
                glyph: crate::font::StaticGlyph {
                    x_advance: Some(x_advance),
                    ..crate::font::StaticGlyph::default()
                },
            },
        );
        VariableGlyph {
            name: name.to_string(),
            layers,
            ..VariableGlyph::default()
        }
    }

    fn advance_change(glyph_name: &str, x_advance: f64) -> Change {
        Change::set(
            vec![
                "glyphs".into(),
                glyph_name.into(),
                "layers".into(),
                "default".into(),
                "glyph".into(),
            ],
            "xAdvance",
            json!(x_advance),
        )
    }

    fn seeded_backend() -> Arc<MemoryBackend> {
        let backend = MemoryBackend::new();
        backend.insert_glyph(simple_glyph("A", 500.0), vec![0x41]);
        Arc::new(backend)
    }

    #[test]
    fn glyph_set_tracker_keeps_sets_disjoint() {
        let mut tracker = GlyphSetTracker::default();
        tracker.note_assigned("A", true);
        assert!(tracker.new_keys.is_empty());

        tracker.note_assigned("B", false);
        assert!(tracker.new_keys.contains("B"));

        tracker.note_deleted("B");
        assert!(!tracker.new_keys.contains("B"));
        assert!(tracker.deleted_keys.contains("B"));

        tracker.note_assigned("B", false);
        assert!(tracker.new_keys.contains("B"));
        assert!(!tracker.deleted_keys.contains("B"));
    }

    #[test]
    fn assembly_tracks_root_assignments_and_glyph_edits() {
        let mut assembly = FontAssembly::new();
        assembly.attach_root("unitsPerEm", json!(1000));
        assembly.attach_glyph("A", json!({"name": "A"}));

        let change = Change::group(vec![
            Change::set(Vec::new(), "unitsPerEm", json!(2048)),
            Change::set(vec!["glyphs".into()], "B", json!({"name": "B"})),
            Change::delete(vec!["glyphs".into()], "A"),
        ]);
        assembly.apply(&change).unwrap();

        assert_eq!(assembly.assigned_roots(), vec!["unitsPerEm".to_string()]);
        assert_eq!(assembly.glyph_names(), vec!["B".to_string()]);
        assert_eq!(assembly.deleted_glyph_names(), vec!["A".to_string()]);
        assert_eq!(assembly.root_value("unitsPerEm"), Some(&json!(2048)));
    }

    #[tokio::test]
    async fn edit_final_commits_cache_and_queues_write() {
        let backend = seeded_backend();
        let handler = FontHandler::new(backend, HandlerOptions::default());
        let conn = connection("c1");

        handler
            .edit_final(advance_change("A", 640.0), None, "adjust advance", false, &conn)
            .await
            .unwrap();

        let glyph = handler.get_glyph("A").await.unwrap().unwrap();
        assert_eq!(glyph.layers["default"].glyph.x_advance, Some(640.0));

        let state = handler.state.lock().await;
        let queue = state.write_queue.as_ref().unwrap();
        assert_eq!(queue.len(), 1);
        assert!(queue.contains_key(&DataKey::glyph("A")));
    }

    #[tokio::test]
    async fn pending_writes_coalesce_per_key() {
        let backend = seeded_backend();
        let handler = FontHandler::new(Arc::clone(&backend) as Arc<dyn ReadBackend>, HandlerOptions::default());
        let conn = connection("c1");

        handler
            .edit_final(advance_change("A", 600.0), None, "first", false, &conn)
            .await
            .unwrap();
        handler
            .edit_final(advance_change("A", 700.0), None, "second", false, &conn)
            .await
            .unwrap();

        {
            let state = handler.state.lock().await;
            assert_eq!(state.write_queue.as_ref().unwrap().len(), 1);
        }

        handler.start();
        handler.finish_writing().await.unwrap();

        let stored = backend.stored_glyph("A").unwrap();
        assert_eq!(stored.layers["default"].glyph.x_advance, Some(700.0));
        handler.close().await.unwrap();
    }

    #[tokio::test]
    async fn dummy_editor_edits_without_persisting() {
        let backend = seeded_backend();
        let handler = FontHandler::new(
            Arc::clone(&backend) as Arc<dyn ReadBackend>,
            HandlerOptions {
                read_only: true,
                dummy_editor: true,
                ..HandlerOptions::default()
            },
        );
        assert!(!handler.is_read_only());
        let conn = connection("c1");

        handler
            .edit_final(advance_change("A", 800.0), None, "edit", false, &conn)
            .await
            .unwrap();

        let glyph = handler.get_glyph("A").await.unwrap().unwrap();
        assert_eq!(glyph.layers["default"].glyph.x_advance, Some(800.0));

        let state = handler.state.lock().await;
        assert!(state.write_queue.as_ref().unwrap().is_empty());
        assert_eq!(
            backend.stored_glyph("A").unwrap().layers["default"].glyph.x_advance,
            Some(500.0)
        );
    }

    #[tokio::test]
    async fn read_only_backend_forces_read_only_mode() {
        let backend = Arc::new(MemoryBackend::new().read_only());
        let handler = FontHandler::new(backend, HandlerOptions::default());
        assert!(handler.is_read_only());
    }

    #[tokio::test]
    async fn unknown_root_key_is_rejected() {
        let backend = seeded_backend();
        let handler = FontHandler::new(backend, HandlerOptions::default());
        let conn = connection("c1");

        let change = Change::set(vec!["bogus".into()], "field", json!(1));
        let result = handler
            .edit_final(change, None, "bad", false, &conn)
            .await;
        assert!(matches!(result, Err(Error::UnknownKey(_))));
    }

    #[tokio::test]
    async fn backend_info_reports_usage_feature() {
        let handler = FontHandler::new(seeded_backend(), HandlerOptions::default());
        let info = handler.get_backend_info();
        assert_eq!(info.name, "memory");
        assert!(info.features.glyphs_used_by);
    }

    #[tokio::test]
    async fn dependency_tracker_follows_edits() {
        let backend = MemoryBackend::new();
        backend.insert_glyph(simple_glyph("A", 500.0), vec![0x41]);
        let mut composite = simple_glyph("Aacute", 500.0);
        composite
            .layers
            .get_mut("default")
            .unwrap()
            .glyph
            .components
            .push(crate::font::Component {
                name: "A".to_string(),
                ..crate::font::Component::default()
            });
        backend.insert_glyph(composite, vec![0xC1]);

        let handler = FontHandler::new(Arc::new(backend), HandlerOptions::default());
        handler.get_glyph("Aacute").await.unwrap();

        assert_eq!(handler.glyph_made_of("Aacute").await, vec!["A"]);
        assert_eq!(handler.glyph_used_by("A").await, vec!["Aacute"]);

        // Deleting the composite clears its edges.
        let conn = connection("c1");
        let change = Change::delete(vec!["glyphs".into()], "Aacute");
        handler
            .edit_final(change, None, "delete", false, &conn)
            .await
            .unwrap();
        assert!(handler.glyph_used_by("A").await.is_empty());
    }
}
