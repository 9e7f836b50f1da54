//! In-memory collaborators for testing.
//!
//! [`MemoryBackend`] simulates the hosted data service: server-assigned ids,
//! server timestamps, filtered fan-out to subscribers, the RPCs the engine
//! calls, and owner/author authorization. Failure injection lets tests
//! exercise every degraded path (failed writes, missing columns, dropped
//! push events, connection loss).
//!
//! Clones share state, so one backend can serve several participants via
//! [`MemoryBackend::connect_as`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use convo_sync_types::{Channel, ChangeKind, MessageRecord, RawChange, Table, Timestamp, UserId};
use serde_json::{json, Map, Value};

use super::{
    rpc, BackendError, BlobStore, ChannelBackend, ChannelStatus, FeedSignal, Filter, Query,
    SignalCallback, SubscriptionHandle,
};

struct Subscriber {
    table: Table,
    filter: Filter,
    callback: SignalCallback,
}

type Delivery = (SignalCallback, FeedSignal);

#[derive(Default)]
struct MemoryInner {
    tables: HashMap<Table, Vec<Value>>,
    next_message: u64,
    next_row: u64,
    clock: u64,
    subscribers: HashMap<u64, Subscriber>,
    next_handle: u64,
    fail_next_insert: Option<BackendError>,
    fail_next_update: Option<BackendError>,
    fail_next_query: Option<BackendError>,
    fail_next_rpc: Option<BackendError>,
    fail_next_subscribe: Option<BackendError>,
    missing_columns: HashSet<String>,
    dropped_events: usize,
    offline: bool,
    rpc_log: Vec<String>,
}

impl MemoryInner {
    /// Server clock: wall time, strictly increasing.
    fn tick(&mut self) -> u64 {
        let now = Timestamp::now().value();
        self.clock = now.max(self.clock + 1);
        self.clock
    }

    fn rows(&mut self, table: Table) -> &mut Vec<Value> {
        self.tables.entry(table).or_default()
    }

    fn find(&self, table: Table, id: &str) -> Option<usize> {
        self.tables
            .get(&table)?
            .iter()
            .position(|row| row.get("id").and_then(Value::as_str) == Some(id))
    }

    fn check_schema(&self, record: &Map<String, Value>) -> Result<(), BackendError> {
        match record.keys().find(|k| self.missing_columns.contains(*k)) {
            Some(column) => Err(BackendError::SchemaMismatch {
                column: column.clone(),
            }),
            None => Ok(()),
        }
    }

    fn channel_owner(&self, channel_id: &Value) -> Option<String> {
        let rows = self.tables.get(&Table::Channels)?;
        let channel = rows.iter().find(|row| row.get("id") == Some(channel_id))?;
        channel
            .get("owner_id")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn channel_restricted(&self, channel_id: &Value) -> bool {
        self.tables
            .get(&Table::Channels)
            .and_then(|rows| rows.iter().find(|row| row.get("id") == Some(channel_id)))
            .and_then(|row| row.get("restricted"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Fan a change out to matching subscribers. Callbacks run after the
    /// lock is released.
    fn collect(&mut self, change: RawChange) -> Vec<Delivery> {
        if self.offline {
            return Vec::new();
        }
        if self.dropped_events > 0 {
            self.dropped_events -= 1;
            tracing::debug!("Dropping push event for {}", change.table);
            return Vec::new();
        }
        let row = change.new.as_ref().or(change.old.as_ref());
        self.subscribers
            .values()
            .filter(|s| s.table == change.table)
            .filter(|s| row.map(|r| s.filter.matches(r)).unwrap_or(false))
            .map(|s| (Arc::clone(&s.callback), FeedSignal::Change(change.clone())))
            .collect()
    }

    fn broadcast_status(&self, status: ChannelStatus) -> Vec<Delivery> {
        self.subscribers
            .values()
            .map(|s| (Arc::clone(&s.callback), FeedSignal::Status(status.clone())))
            .collect()
    }

    fn insert_row(
        &mut self,
        table: Table,
        record: Value,
        actor: Option<&UserId>,
    ) -> Result<(Value, RawChange), BackendError> {
        let Value::Object(mut row) = record else {
            return Err(BackendError::Rejected("record must be an object".into()));
        };
        self.check_schema(&row)?;

        match table {
            Table::Messages => {
                let channel_id = row.get("channel_id").cloned().unwrap_or(Value::Null);
                let author = row.get("author_id").and_then(Value::as_str).unwrap_or_default();
                if let Some(actor) = actor {
                    if actor.as_str() != author {
                        return Err(BackendError::Unauthorized(
                            "cannot author messages for another user".into(),
                        ));
                    }
                }
                if self.channel_restricted(&channel_id)
                    && self.channel_owner(&channel_id).as_deref() != Some(author)
                {
                    return Err(BackendError::Unauthorized("channel is restricted".into()));
                }

                self.next_message += 1;
                row.insert("id".into(), json!(format!("m{}", self.next_message)));
                if row.get("created_at").map(Value::is_null).unwrap_or(true) {
                    let now = self.tick();
                    row.insert("created_at".into(), json!(now));
                }
                row.entry("is_deleted").or_insert(json!(false));
                if !self.missing_columns.contains("view_count") {
                    row.entry("view_count").or_insert(json!(0));
                }
            }
            Table::Reactions => {
                let duplicate = self.rows(Table::Reactions).iter().any(|r| {
                    ["message_id", "user_id", "emoji"]
                        .iter()
                        .all(|k| r.get(*k) == row.get(*k))
                });
                if duplicate {
                    return Err(BackendError::Rejected("duplicate reaction".into()));
                }
                self.next_row += 1;
                row.insert("id".into(), json!(format!("r{}", self.next_row)));
            }
            Table::Channels => {
                if !row.contains_key("id") {
                    return Err(BackendError::Rejected("channel row without id".into()));
                }
            }
            Table::ReadCursors => {
                self.next_row += 1;
                row.entry("id")
                    .or_insert(json!(format!("r{}", self.next_row)));
            }
        }

        let row = Value::Object(row);
        self.rows(table).push(row.clone());
        Ok((row.clone(), RawChange::insert(table, row)))
    }

    fn update_row(
        &mut self,
        table: Table,
        id: &str,
        patch: Value,
        actor: Option<&UserId>,
    ) -> Result<(Value, RawChange), BackendError> {
        let Value::Object(patch) = patch else {
            return Err(BackendError::Rejected("patch must be an object".into()));
        };
        self.check_schema(&patch)?;
        let index = self
            .find(table, id)
            .ok_or_else(|| BackendError::NotFound(format!("{} {}", table, id)))?;

        let current = self.rows(table)[index].clone();
        if let Some(actor) = actor {
            let allowed = match table {
                Table::Channels => {
                    let owner = current.get("owner_id").and_then(Value::as_str);
                    owner.is_none() || owner == Some(actor.as_str())
                }
                Table::Messages => {
                    let channel_id = current.get("channel_id").cloned().unwrap_or(Value::Null);
                    current.get("author_id").and_then(Value::as_str) == Some(actor.as_str())
                        || self.channel_owner(&channel_id).as_deref() == Some(actor.as_str())
                }
                _ => true,
            };
            if !allowed {
                return Err(BackendError::Unauthorized(format!(
                    "{} may not update {} {}",
                    actor, table, id
                )));
            }
        }

        let mut updated = current.clone();
        if let Value::Object(fields) = &mut updated {
            for (key, value) in patch {
                fields.insert(key, value);
            }
        }
        self.rows(table)[index] = updated.clone();

        let change = RawChange {
            table,
            kind: ChangeKind::Update,
            new: Some(updated.clone()),
            old: Some(current),
        };
        Ok((updated, change))
    }

    fn upsert_read_cursor(
        &mut self,
        channel_id: &str,
        user_id: &str,
        last_message_id: Value,
    ) -> (Value, RawChange) {
        let now = self.tick();
        let existing = self.rows(Table::ReadCursors).iter().position(|r| {
            r.get("channel_id").and_then(Value::as_str) == Some(channel_id)
                && r.get("user_id").and_then(Value::as_str) == Some(user_id)
        });

        match existing {
            Some(index) => {
                let old = self.rows(Table::ReadCursors)[index].clone();
                let mut row = old.clone();
                row["last_read_at"] = json!(now);
                row["last_message_id"] = last_message_id;
                self.rows(Table::ReadCursors)[index] = row.clone();
                let change = RawChange {
                    table: Table::ReadCursors,
                    kind: ChangeKind::Update,
                    new: Some(row.clone()),
                    old: Some(old),
                };
                (row, change)
            }
            None => {
                self.next_row += 1;
                let row = json!({
                    "id": format!("r{}", self.next_row),
                    "channel_id": channel_id,
                    "user_id": user_id,
                    "last_read_at": now,
                    "last_message_id": last_message_id,
                });
                self.rows(Table::ReadCursors).push(row.clone());
                (row.clone(), RawChange::insert(Table::ReadCursors, row))
            }
        }
    }
}

fn arg_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, BackendError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::Rejected(format!("missing argument {}", key)))
}

fn deliver(deliveries: Vec<Delivery>) {
    for (callback, signal) in deliveries {
        callback(signal);
    }
}

/// In-memory hosted data service.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryInner>>,
    user: Option<UserId>,
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl MemoryBackend {
    /// Create an empty backend with no session user (no authorization checks).
    pub fn new() -> Self {
        Self::default()
    }

    /// A session on the same backend acting as `user`.
    pub fn connect_as(&self, user: UserId) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            user: Some(user),
        }
    }

    /// The session user, if any.
    pub fn user(&self) -> Option<&UserId> {
        self.user.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a channel row without notifying subscribers.
    pub fn seed_channel(&self, channel: &Channel) -> Result<(), BackendError> {
        let row = serde_json::to_value(channel).map_err(|e| BackendError::Rejected(e.to_string()))?;
        self.lock().rows(Table::Channels).push(row);
        Ok(())
    }

    /// Store a message row without notifying subscribers. Returns the stored row.
    pub fn seed_message(&self, record: &MessageRecord) -> Result<Value, BackendError> {
        let row = serde_json::to_value(record).map_err(|e| BackendError::Rejected(e.to_string()))?;
        let (row, _) = self.lock().insert_row(Table::Messages, row, None)?;
        Ok(row)
    }

    /// Hard-delete a row and notify subscribers. Returns whether it existed.
    pub fn remove_row(&self, table: Table, id: &str) -> bool {
        let deliveries = {
            let mut inner = self.lock();
            let Some(index) = inner.find(table, id) else {
                return false;
            };
            let old = inner.rows(table).remove(index);
            inner.collect(RawChange::delete(table, old))
        };
        deliver(deliveries);
        true
    }

    /// All rows of a table.
    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.lock().rows(table).clone()
    }

    /// Names of RPCs called so far, in order.
    pub fn rpc_calls(&self) -> Vec<String> {
        self.lock().rpc_log.clone()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Cause the next insert() to fail.
    pub fn fail_next_insert(&self, error: BackendError) {
        self.lock().fail_next_insert = Some(error);
    }

    /// Cause the next update() to fail.
    pub fn fail_next_update(&self, error: BackendError) {
        self.lock().fail_next_update = Some(error);
    }

    /// Cause the next query() to fail.
    pub fn fail_next_query(&self, error: BackendError) {
        self.lock().fail_next_query = Some(error);
    }

    /// Cause the next rpc() to fail.
    pub fn fail_next_rpc(&self, error: BackendError) {
        self.lock().fail_next_rpc = Some(error);
    }

    /// Cause the next subscribe() to fail.
    pub fn fail_next_subscribe(&self, error: BackendError) {
        self.lock().fail_next_subscribe = Some(error);
    }

    /// Pretend the server schema lacks `column`; writes using it fail.
    pub fn drop_column(&self, column: &str) {
        self.lock().missing_columns.insert(column.to_string());
    }

    /// Silently lose the next `count` push events.
    pub fn drop_next_events(&self, count: usize) {
        self.lock().dropped_events += count;
    }

    /// Toggle the push connection. Subscribers get a status signal; while
    /// offline no changes are pushed (and none are replayed later).
    pub fn set_online(&self, online: bool) {
        let deliveries = {
            let mut inner = self.lock();
            if inner.offline != online {
                return;
            }
            inner.offline = !online;
            let status = if online {
                ChannelStatus::Connected
            } else {
                ChannelStatus::Disconnected {
                    reason: "connection lost".into(),
                }
            };
            inner.broadcast_status(status)
        };
        deliver(deliveries);
    }

    /// Report a subscription error to every subscriber.
    pub fn raise_channel_error(&self, reason: &str) {
        let deliveries = self.lock().broadcast_status(ChannelStatus::Error {
            reason: reason.to_string(),
        });
        deliver(deliveries);
    }
}

#[async_trait]
impl ChannelBackend for MemoryBackend {
    async fn insert(&self, table: Table, record: Value) -> Result<Value, BackendError> {
        let (row, deliveries) = {
            let mut inner = self.lock();
            if let Some(error) = inner.fail_next_insert.take() {
                return Err(error);
            }
            let (row, change) = inner.insert_row(table, record, self.user.as_ref())?;
            (row, inner.collect(change))
        };
        deliver(deliveries);
        Ok(row)
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, BackendError> {
        let (row, deliveries) = {
            let mut inner = self.lock();
            if let Some(error) = inner.fail_next_update.take() {
                return Err(error);
            }
            let (row, change) = inner.update_row(table, id, patch, self.user.as_ref())?;
            (row, inner.collect(change))
        };
        deliver(deliveries);
        Ok(row)
    }

    async fn query(&self, table: Table, query: &Query) -> Result<Vec<Value>, BackendError> {
        let mut inner = self.lock();
        if let Some(error) = inner.fail_next_query.take() {
            return Err(error);
        }
        let mut rows: Vec<Value> = inner
            .rows(table)
            .iter()
            .filter(|row| query.matches(row))
            .cloned()
            .collect();
        query.arrange(&mut rows);
        Ok(rows)
    }

    async fn subscribe(
        &self,
        table: Table,
        filter: Filter,
        callback: SignalCallback,
    ) -> Result<SubscriptionHandle, BackendError> {
        let (handle, status) = {
            let mut inner = self.lock();
            if let Some(error) = inner.fail_next_subscribe.take() {
                return Err(error);
            }
            inner.next_handle += 1;
            let handle = inner.next_handle;
            inner.subscribers.insert(
                handle,
                Subscriber {
                    table,
                    filter,
                    callback: Arc::clone(&callback),
                },
            );
            let status = if inner.offline {
                ChannelStatus::Disconnected {
                    reason: "connection lost".into(),
                }
            } else {
                ChannelStatus::Connected
            };
            (SubscriptionHandle(handle), status)
        };
        callback(FeedSignal::Status(status));
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BackendError> {
        self.lock().subscribers.remove(&handle.0);
        Ok(())
    }

    async fn rpc(&self, name: &str, args: Value) -> Result<Value, BackendError> {
        let (result, deliveries) = {
            let mut inner = self.lock();
            inner.rpc_log.push(name.to_string());
            if let Some(error) = inner.fail_next_rpc.take() {
                return Err(error);
            }
            let actor = self.user.as_ref();

            match name {
                rpc::SEND_MESSAGE => {
                    let record = args.get("record").cloned().unwrap_or(args);
                    let (row, change) = inner.insert_row(Table::Messages, record, actor)?;
                    let mut deliveries = inner.collect(change);
                    let channel_id = arg_str(&row, "channel_id")?.to_string();
                    let author_id = arg_str(&row, "author_id")?.to_string();
                    let (_, cursor_change) =
                        inner.upsert_read_cursor(&channel_id, &author_id, row["id"].clone());
                    deliveries.extend(inner.collect(cursor_change));
                    (row, deliveries)
                }
                rpc::TOGGLE_REACTION => {
                    let message_id = arg_str(&args, "message_id")?.to_string();
                    let user_id = arg_str(&args, "user_id")?.to_string();
                    let emoji = arg_str(&args, "emoji")?.to_string();
                    if let Some(actor) = actor {
                        if actor.as_str() != user_id {
                            return Err(BackendError::Unauthorized(
                                "cannot react for another user".into(),
                            ));
                        }
                    }
                    let message_index = inner
                        .find(Table::Messages, &message_id)
                        .ok_or_else(|| BackendError::NotFound(format!("message {}", message_id)))?;
                    let channel_id = inner.rows(Table::Messages)[message_index]["channel_id"].clone();

                    let existing = inner.rows(Table::Reactions).iter().position(|r| {
                        r["message_id"] == json!(message_id)
                            && r["user_id"] == json!(user_id)
                            && r["emoji"] == json!(emoji)
                    });
                    match existing {
                        Some(index) => {
                            let old = inner.rows(Table::Reactions).remove(index);
                            let deliveries = inner.collect(RawChange::delete(Table::Reactions, old));
                            (json!({"added": false}), deliveries)
                        }
                        None => {
                            let record = json!({
                                "message_id": message_id,
                                "user_id": user_id,
                                "emoji": emoji,
                                "channel_id": channel_id,
                            });
                            let (_, change) = inner.insert_row(Table::Reactions, record, None)?;
                            (json!({"added": true}), inner.collect(change))
                        }
                    }
                }
                rpc::MARK_READ => {
                    let channel_id = arg_str(&args, "channel_id")?.to_string();
                    let user_id = arg_str(&args, "user_id")?.to_string();
                    let last = args.get("last_message_id").cloned().unwrap_or(Value::Null);
                    let (row, change) = inner.upsert_read_cursor(&channel_id, &user_id, last);
                    (row, inner.collect(change))
                }
                rpc::INCREMENT_VIEW_COUNT => {
                    if inner.missing_columns.contains("view_count") {
                        return Err(BackendError::SchemaMismatch {
                            column: "view_count".into(),
                        });
                    }
                    let message_id = arg_str(&args, "message_id")?.to_string();
                    let current = inner
                        .find(Table::Messages, &message_id)
                        .map(|i| inner.rows(Table::Messages)[i]["view_count"].as_u64().unwrap_or(0))
                        .ok_or_else(|| BackendError::NotFound(format!("message {}", message_id)))?;
                    let (_, change) = inner.update_row(
                        Table::Messages,
                        &message_id,
                        json!({"view_count": current + 1}),
                        None,
                    )?;
                    (json!({"view_count": current + 1}), inner.collect(change))
                }
                other => return Err(BackendError::NotFound(format!("rpc {}", other))),
            }
        };
        deliver(deliveries);
        Ok(result)
    }
}

#[derive(Default)]
struct BlobInner {
    objects: HashMap<String, (Vec<u8>, String)>,
    fail_next_upload: Option<BackendError>,
}

/// In-memory attachment storage.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    inner: Arc<Mutex<BlobInner>>,
}

impl fmt::Debug for MemoryBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlobStore")
            .field("objects", &self.object_count())
            .finish()
    }
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BlobInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cause the next upload() to fail.
    pub fn fail_next_upload(&self, error: BackendError) {
        self.lock().fail_next_upload = Some(error);
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Stored bytes and mime type of an object.
    pub fn object(&self, bucket: &str, path: &str) -> Option<(Vec<u8>, String)> {
        self.lock().objects.get(&format!("{}/{}", bucket, path)).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<(), BackendError> {
        let mut inner = self.lock();
        if let Some(error) = inner.fail_next_upload.take() {
            return Err(error);
        }
        let key = format!("{}/{}", bucket, path);
        if inner.objects.contains_key(&key) {
            return Err(BackendError::Rejected(format!("object exists: {}", key)));
        }
        inner
            .objects
            .insert(key, (bytes.to_vec(), mime_type.to_string()));
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("memory://{}/{}", bucket, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Order;
    use convo_sync_types::{ChannelId, MessageId};

    fn general(restricted: bool) -> Channel {
        Channel {
            id: ChannelId::new("general"),
            name: "General".into(),
            description: None,
            owner_id: Some(UserId::new("alice")),
            pinned_message_id: None,
            member_count: 2,
            restricted,
        }
    }

    fn record(author: &str, content: &str) -> Value {
        json!({
            "channel_id": "general",
            "author_id": author,
            "content": content,
        })
    }

    fn recorder() -> (SignalCallback, Arc<Mutex<Vec<FeedSignal>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: SignalCallback = Arc::new(move |signal| sink.lock().unwrap().push(signal));
        (callback, seen)
    }

    fn changes(seen: &Arc<Mutex<Vec<FeedSignal>>>) -> Vec<RawChange> {
        seen.lock()
            .unwrap()
            .iter()
            .filter_map(|s| match s {
                FeedSignal::Change(c) => Some(c.clone()),
                FeedSignal::Status(_) => None,
            })
            .collect()
    }

    // ===========================================
    // Row Tests
    // ===========================================

    #[tokio::test]
    async fn insert_assigns_sequential_ids_and_timestamps() {
        let backend = MemoryBackend::new();

        let first = backend.insert(Table::Messages, record("alice", "a")).await.unwrap();
        let second = backend.insert(Table::Messages, record("alice", "b")).await.unwrap();

        assert_eq!(first["id"], "m1");
        assert_eq!(second["id"], "m2");
        assert!(second["created_at"].as_u64().unwrap() > first["created_at"].as_u64().unwrap());
        assert_eq!(first["view_count"], 0);
    }

    #[tokio::test]
    async fn query_filters_and_orders() {
        let backend = MemoryBackend::new();
        backend.insert(Table::Messages, record("alice", "a")).await.unwrap();
        backend.insert(Table::Messages, record("bob", "b")).await.unwrap();

        let rows = backend
            .query(
                Table::Messages,
                &Query::new()
                    .eq("author_id", "bob")
                    .order("created_at", Order::Descending),
            )
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["content"], "b");
    }

    #[tokio::test]
    async fn update_unknown_row_is_not_found() {
        let backend = MemoryBackend::new();
        let result = backend
            .update(Table::Messages, "m9", json!({"content": "x"}))
            .await;
        assert!(matches!(result, Err(BackendError::NotFound(_))));
    }

    // ===========================================
    // Authorization Tests
    // ===========================================

    #[tokio::test]
    async fn restricted_channel_rejects_non_owner() {
        let backend = MemoryBackend::new();
        backend.seed_channel(&general(true)).unwrap();

        let bob = backend.connect_as(UserId::new("bob"));
        let result = bob.insert(Table::Messages, record("bob", "hi")).await;
        assert!(matches!(result, Err(BackendError::Unauthorized(_))));

        let alice = backend.connect_as(UserId::new("alice"));
        assert!(alice.insert(Table::Messages, record("alice", "hi")).await.is_ok());
    }

    #[tokio::test]
    async fn only_owner_updates_channel() {
        let backend = MemoryBackend::new();
        backend.seed_channel(&general(false)).unwrap();

        let bob = backend.connect_as(UserId::new("bob"));
        let result = bob
            .update(Table::Channels, "general", json!({"pinned_message_id": "m1"}))
            .await;
        assert!(matches!(result, Err(BackendError::Unauthorized(_))));
    }

    // ===========================================
    // Subscription Tests
    // ===========================================

    #[tokio::test]
    async fn subscribe_reports_connected_and_fans_out_matching_rows() {
        let backend = MemoryBackend::new();
        let (callback, seen) = recorder();
        backend
            .subscribe(Table::Messages, Filter::eq("channel_id", "general"), callback)
            .await
            .unwrap();

        backend.insert(Table::Messages, record("alice", "in scope")).await.unwrap();
        backend
            .insert(
                Table::Messages,
                json!({"channel_id": "random", "author_id": "alice", "content": "elsewhere"}),
            )
            .await
            .unwrap();

        let signals = seen.lock().unwrap().clone();
        assert_eq!(signals[0], FeedSignal::Status(ChannelStatus::Connected));
        assert_eq!(changes(&seen).len(), 1);
    }

    #[tokio::test]
    async fn offline_suppresses_fan_out_and_reports_status() {
        let backend = MemoryBackend::new();
        let (callback, seen) = recorder();
        backend
            .subscribe(Table::Messages, Filter::eq("channel_id", "general"), callback)
            .await
            .unwrap();

        backend.set_online(false);
        backend.insert(Table::Messages, record("alice", "missed")).await.unwrap();
        backend.set_online(true);

        assert!(changes(&seen).is_empty());
        let signals = seen.lock().unwrap().clone();
        assert!(signals.contains(&FeedSignal::Status(ChannelStatus::Disconnected {
            reason: "connection lost".into()
        })));
        assert_eq!(
            signals.last(),
            Some(&FeedSignal::Status(ChannelStatus::Connected))
        );
    }

    #[tokio::test]
    async fn dropped_events_are_lost() {
        let backend = MemoryBackend::new();
        let (callback, seen) = recorder();
        backend
            .subscribe(Table::Messages, Filter::eq("channel_id", "general"), callback)
            .await
            .unwrap();

        backend.drop_next_events(1);
        backend.insert(Table::Messages, record("alice", "lost")).await.unwrap();
        backend.insert(Table::Messages, record("alice", "kept")).await.unwrap();

        let received = changes(&seen);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].new.as_ref().unwrap()["content"], "kept");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let backend = MemoryBackend::new();
        let (callback, seen) = recorder();
        let handle = backend
            .subscribe(Table::Messages, Filter::eq("channel_id", "general"), callback)
            .await
            .unwrap();

        backend.unsubscribe(handle).await.unwrap();
        backend.insert(Table::Messages, record("alice", "a")).await.unwrap();

        assert!(changes(&seen).is_empty());
        assert_eq!(backend.subscriber_count(), 0);
    }

    // ===========================================
    // RPC Tests
    // ===========================================

    #[tokio::test]
    async fn toggle_reaction_adds_then_removes() {
        let backend = MemoryBackend::new();
        backend.insert(Table::Messages, record("alice", "a")).await.unwrap();
        let args = json!({"message_id": "m1", "user_id": "bob", "emoji": "👍"});

        let first = backend.rpc(rpc::TOGGLE_REACTION, args.clone()).await.unwrap();
        assert_eq!(first["added"], true);
        assert_eq!(backend.rows(Table::Reactions).len(), 1);

        let second = backend.rpc(rpc::TOGGLE_REACTION, args).await.unwrap();
        assert_eq!(second["added"], false);
        assert!(backend.rows(Table::Reactions).is_empty());
    }

    #[tokio::test]
    async fn send_message_inserts_and_marks_author_read() {
        let backend = MemoryBackend::new();

        let row = backend
            .rpc(rpc::SEND_MESSAGE, json!({"record": record("alice", "hi")}))
            .await
            .unwrap();

        assert_eq!(row["id"], "m1");
        let cursors = backend.rows(Table::ReadCursors);
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0]["last_message_id"], "m1");
    }

    #[tokio::test]
    async fn mark_read_upserts() {
        let backend = MemoryBackend::new();
        let args = json!({"channel_id": "general", "user_id": "bob", "last_message_id": "m1"});

        backend.rpc(rpc::MARK_READ, args.clone()).await.unwrap();
        backend.rpc(rpc::MARK_READ, args).await.unwrap();

        assert_eq!(backend.rows(Table::ReadCursors).len(), 1);
    }

    #[tokio::test]
    async fn increment_view_count_bumps_counter() {
        let backend = MemoryBackend::new();
        backend.insert(Table::Messages, record("alice", "a")).await.unwrap();

        backend
            .rpc(rpc::INCREMENT_VIEW_COUNT, json!({"message_id": "m1"}))
            .await
            .unwrap();
        let result = backend
            .rpc(rpc::INCREMENT_VIEW_COUNT, json!({"message_id": "m1"}))
            .await
            .unwrap();

        assert_eq!(result["view_count"], 2);
        assert_eq!(backend.rows(Table::Messages)[0]["view_count"], 2);
    }

    #[tokio::test]
    async fn unknown_rpc_is_not_found() {
        let backend = MemoryBackend::new();
        let result = backend.rpc("drop_everything", json!({})).await;
        assert!(matches!(result, Err(BackendError::NotFound(_))));
    }

    // ===========================================
    // Failure Injection Tests
    // ===========================================

    #[tokio::test]
    async fn missing_column_fails_write() {
        let backend = MemoryBackend::new();
        backend.drop_column("batch_id");

        let mut row = record("alice", "a");
        row["batch_id"] = json!("b");
        let result = backend.insert(Table::Messages, row).await;

        assert_eq!(
            result,
            Err(BackendError::SchemaMismatch {
                column: "batch_id".into()
            })
        );
        assert!(backend.insert(Table::Messages, record("alice", "a")).await.is_ok());
    }

    #[tokio::test]
    async fn forced_rpc_failure_is_one_shot() {
        let backend = MemoryBackend::new();
        backend.fail_next_rpc(BackendError::Network("timeout".into()));

        let args = json!({"record": record("alice", "a")});
        assert!(backend.rpc(rpc::SEND_MESSAGE, args.clone()).await.is_err());
        assert!(backend.rpc(rpc::SEND_MESSAGE, args).await.is_ok());
        assert_eq!(backend.rpc_calls(), vec![rpc::SEND_MESSAGE, rpc::SEND_MESSAGE]);
    }

    #[tokio::test]
    async fn remove_row_pushes_delete() {
        let backend = MemoryBackend::new();
        let (callback, seen) = recorder();
        backend
            .subscribe(Table::Messages, Filter::eq("channel_id", "general"), callback)
            .await
            .unwrap();
        backend.insert(Table::Messages, record("alice", "a")).await.unwrap();

        assert!(backend.remove_row(Table::Messages, "m1"));
        assert!(!backend.remove_row(Table::Messages, "m1"));

        let last = changes(&seen).pop().unwrap();
        assert_eq!(last.kind, ChangeKind::Delete);
        assert_eq!(
            last.old.as_ref().and_then(|r| r["id"].as_str()).map(MessageId::new),
            Some(MessageId::new("m1"))
        );
    }

    // ===========================================
    // Blob Store Tests
    // ===========================================

    #[tokio::test]
    async fn blob_store_uploads_and_builds_urls() {
        let blobs = MemoryBlobStore::new();
        blobs
            .upload("chat-attachments", "general/a.png", b"png", "image/png")
            .await
            .unwrap();

        assert_eq!(blobs.object_count(), 1);
        assert_eq!(
            blobs.object("chat-attachments", "general/a.png"),
            Some((b"png".to_vec(), "image/png".to_string()))
        );
        assert_eq!(
            blobs.public_url("chat-attachments", "general/a.png"),
            "memory://chat-attachments/general/a.png"
        );
    }

    #[tokio::test]
    async fn blob_store_forced_failure() {
        let blobs = MemoryBlobStore::new();
        blobs.fail_next_upload(BackendError::Network("timeout".into()));

        let result = blobs.upload("b", "p", b"x", "text/plain").await;
        assert!(matches!(result, Err(BackendError::Network(_))));
        assert_eq!(blobs.object_count(), 0);
    }
}
