//! Durable queue of mutations made while the remote was unreachable.
//!
//! Operations drain strictly in FIFO order, one at a time. When an operation
//! fails or is still backing off, later operations on the same collection wait
//! for the next cycle so causal order within a collection is never broken.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fieldkeep_common::{CollectionName, Error, Payload, Result};
use fieldkeep_storage::{keys, load_record, save_record, CollectionShape, DataProvider, KeyValueStore};

use crate::ledger::Delta;
use crate::retry::RetryConfig;
use crate::snapshot::SnapshotStore;
use crate::staging::as_provider_error;

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Completed,
    /// Terminal until an operator retries or clears it.
    Failed,
}

/// A queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineOperation {
    pub id: String,
    pub kind: OperationKind,
    pub target_collection: CollectionName,
    /// The record to create or update; for deletes only its `id` is used.
    pub payload: Value,
    pub status: OperationStatus,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Backoff: not retried before this instant.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl OfflineOperation {
    pub fn new(kind: OperationKind, target_collection: CollectionName, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            target_collection,
            payload,
            status: OperationStatus::Pending,
            attempt_count: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Not yet applied and not given up on.
    pub fn is_waiting(&self) -> bool {
        matches!(self.status, OperationStatus::Pending | OperationStatus::InFlight)
    }

    /// Whether backoff allows an attempt at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// The record identifier carried in the payload.
    pub fn record_id(&self) -> Option<String> {
        record_id(&self.payload)
    }
}

fn record_id(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Applies an operation to its target.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn apply(&self, op: &OfflineOperation) -> Result<()>;
}

/// Applies operations to collections of a data provider.
///
/// List collections hold records matched by their `id` field; map collections
/// are keyed by the record id. Creates are upserts and deletes of missing
/// records succeed, so replaying an operation is harmless.
///
/// Each application is a read-modify-write of the whole provider state and
/// holds `gate` throughout.
pub struct ProviderHandler {
    provider: Arc<dyn DataProvider>,
    gate: Arc<Mutex<()>>,
}

impl ProviderHandler {
    /// Handler with a private gate. Only safe when nothing else writes to
    /// `provider`.
    pub fn new(provider: Arc<dyn DataProvider>) -> Self {
        Self {
            provider,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Handler for the snapshot store's provider, serialized with its
    /// snapshots and restores.
    pub fn for_snapshots(snapshots: &SnapshotStore) -> Self {
        Self {
            provider: snapshots.provider().clone(),
            gate: snapshots.mutation_gate(),
        }
    }

    fn shape_of(&self, collection: &CollectionName, existing: Option<&Value>) -> CollectionShape {
        if let Some(spec) = self
            .provider
            .required_collections()
            .into_iter()
            .find(|spec| &spec.name == collection)
        {
            return spec.shape;
        }
        match existing {
            Some(Value::Array(_)) => CollectionShape::List,
            _ => CollectionShape::Map,
        }
    }
}

#[async_trait]
impl OperationHandler for ProviderHandler {
    async fn apply(&self, op: &OfflineOperation) -> Result<()> {
        let id = op.record_id().ok_or_else(|| {
            Error::InvalidInput(format!("Operation {} payload has no record id", op.id))
        })?;

        let _gate = self.gate.lock().await;
        let mut payload: Payload = self.provider.read_all().await.map_err(as_provider_error)?;
        let shape = self.shape_of(&op.target_collection, payload.get(&op.target_collection));
        let collection = payload
            .entry(op.target_collection.clone())
            .or_insert_with(|| shape.empty());
        if !shape.matches(collection) {
            return Err(Error::InvalidInput(format!(
                "Collection {} is not a {:?}",
                op.target_collection, shape
            )));
        }

        match collection {
            Value::Array(records) => {
                let position = records
                    .iter()
                    .position(|r| record_id(r).as_deref() == Some(id.as_str()));
                match (op.kind, position) {
                    (OperationKind::Create, Some(i)) | (OperationKind::Update, Some(i)) => {
                        records[i] = op.payload.clone();
                    }
                    (OperationKind::Create, None) => records.push(op.payload.clone()),
                    (OperationKind::Update, None) => {
                        return Err(Error::NotFound(format!(
                            "Record {} not found in {}",
                            id, op.target_collection
                        )));
                    }
                    (OperationKind::Delete, Some(i)) => {
                        records.remove(i);
                    }
                    (OperationKind::Delete, None) => {}
                }
            }
            Value::Object(records) => match op.kind {
                OperationKind::Create => {
                    records.insert(id, op.payload.clone());
                }
                OperationKind::Update => {
                    let Some(slot) = records.get_mut(&id) else {
                        return Err(Error::NotFound(format!(
                            "Record {} not found in {}",
                            id, op.target_collection
                        )));
                    };
                    *slot = op.payload.clone();
                }
                OperationKind::Delete => {
                    records.remove(&id);
                }
            },
            _ => {
                return Err(Error::InvalidInput(format!(
                    "Collection {} has an unsupported shape",
                    op.target_collection
                )));
            }
        }

        self.provider
            .write_all(payload)
            .await
            .map_err(as_provider_error)
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Applied operations, in the order they were applied.
    pub applied: Vec<(OperationKind, CollectionName)>,
    /// Operations that failed and will be retried.
    pub retried: usize,
    /// Operations that became terminally failed during this pass.
    pub failed: Vec<String>,
    /// Operations skipped for backoff or ordering.
    pub deferred: usize,
    pub cancelled: bool,
}

impl DrainReport {
    pub fn applied_any(&self) -> bool {
        !self.applied.is_empty()
    }

    /// Collections touched by the applied operations.
    pub fn delta(&self) -> Delta {
        let mut delta = Delta::new();
        for (kind, collection) in &self.applied {
            let set = match kind {
                OperationKind::Create => &mut delta.added,
                OperationKind::Update => &mut delta.updated,
                OperationKind::Delete => &mut delta.removed,
            };
            set.insert(collection.clone());
        }
        delta
    }
}

/// Owner of the offline operation queue.
#[derive(Clone)]
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    retry: RetryConfig,
    handlers: Arc<HashMap<CollectionName, Arc<dyn OperationHandler>>>,
    default_handler: Option<Arc<dyn OperationHandler>>,
    ops: Arc<RwLock<Arc<Vec<OfflineOperation>>>>,
    write_gate: Arc<Mutex<()>>,
    drain_gate: Arc<Mutex<()>>,
}

impl OfflineQueue {
    /// Open the queue, loading persisted operations.
    ///
    /// Operations found in flight were interrupted and go back to pending.
    pub async fn open(store: Arc<dyn KeyValueStore>, retry: RetryConfig) -> Result<Self> {
        let mut ops: Vec<OfflineOperation> = load_record(store.as_ref(), keys::OFFLINE_QUEUE)
            .await?
            .unwrap_or_default();
        for op in ops.iter_mut().filter(|op| op.status == OperationStatus::InFlight) {
            op.status = OperationStatus::Pending;
        }

        debug!("Opened offline queue with {} operations", ops.len());

        Ok(Self {
            store,
            retry,
            handlers: Arc::new(HashMap::new()),
            default_handler: None,
            ops: Arc::new(RwLock::new(Arc::new(ops))),
            write_gate: Arc::new(Mutex::new(())),
            drain_gate: Arc::new(Mutex::new(())),
        })
    }

    /// Route operations on `collection` to `handler`.
    pub fn with_handler(mut self, collection: CollectionName, handler: Arc<dyn OperationHandler>) -> Self {
        Arc::make_mut(&mut self.handlers).insert(collection, handler);
        self
    }

    /// Handler for collections without a dedicated one.
    pub fn with_default_handler(mut self, handler: Arc<dyn OperationHandler>) -> Self {
        self.default_handler = Some(handler);
        self
    }

    fn handler_for(&self, op: &OfflineOperation) -> Option<Arc<dyn OperationHandler>> {
        self.handlers
            .get(&op.target_collection)
            .or(self.default_handler.as_ref())
            .cloned()
    }

    /// Append an operation as pending.
    ///
    /// # Errors
    /// - `Storage` if the queue cannot be persisted (nothing is queued)
    pub async fn enqueue(&self, mut op: OfflineOperation) -> Result<OfflineOperation> {
        op.status = OperationStatus::Pending;

        let _gate = self.write_gate.lock().await;
        let mut updated: Vec<OfflineOperation> = self.ops.read().await.iter().cloned().collect();
        updated.push(op.clone());
        self.publish(updated).await?;

        info!("Queued {} on {} ({})", op.kind, op.target_collection, op.id);
        Ok(op)
    }

    /// Apply an operation right away, bypassing the queue.
    pub async fn apply_now(&self, op: &OfflineOperation) -> Result<()> {
        let handler = self.handler_for(op).ok_or_else(|| {
            Error::InvalidInput(format!("No handler for collection {}", op.target_collection))
        })?;
        handler.apply(op).await
    }

    /// Attempt every pending operation once.
    pub async fn drain(&self) -> Result<DrainReport> {
        self.drain_cancellable(&CancellationToken::new()).await
    }

    /// Attempt every pending operation once, checking `cancel` between
    /// operations.
    ///
    /// Drains never overlap, so an operation still marked in flight when a
    /// pass starts was interrupted by an earlier one and is attempted again.
    ///
    /// # Errors
    /// - `Storage` if a transition cannot be persisted; the pass stops and
    ///   the queue keeps its last persisted state
    pub async fn drain_cancellable(&self, cancel: &CancellationToken) -> Result<DrainReport> {
        let _drain = self.drain_gate.lock().await;

        let now = Utc::now();
        let candidates: Vec<String> = self
            .filtered(OfflineOperation::is_waiting)
            .await
            .into_iter()
            .map(|op| op.id)
            .collect();

        let mut report = DrainReport::default();
        let mut blocked: HashSet<CollectionName> = HashSet::new();

        for id in candidates {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            // Operator may have cleared or retried it since the pass started
            let Some(op) = self.find(&id).await else {
                continue;
            };
            if !op.is_waiting() {
                continue;
            }

            if blocked.contains(&op.target_collection) || !op.is_due(now) {
                blocked.insert(op.target_collection.clone());
                report.deferred += 1;
                continue;
            }

            let Some(handler) = self.handler_for(&op) else {
                warn!("No handler for {} on {}, marking failed", op.kind, op.target_collection);
                self.update(&id, |op| {
                    op.status = OperationStatus::Failed;
                    op.last_error = Some("no handler for collection".to_string());
                })
                .await?;
                blocked.insert(op.target_collection.clone());
                report.failed.push(id);
                continue;
            };

            self.update(&id, |op| {
                op.status = OperationStatus::InFlight;
                op.last_attempt_at = Some(now);
            })
            .await?;

            match handler.apply(&op).await {
                Ok(()) => {
                    debug!("Applied {} on {} ({})", op.kind, op.target_collection, id);
                    self.remove(&id).await?;
                    report.applied.push((op.kind, op.target_collection.clone()));
                }
                Err(e) if !self.retry.is_retryable(&e) => {
                    error!(
                        "{} on {} ({}) cannot succeed, marking failed: {}",
                        op.kind, op.target_collection, id, e
                    );
                    self.update(&id, |op| {
                        op.attempt_count += 1;
                        op.status = OperationStatus::Failed;
                        op.next_attempt_at = None;
                        op.last_error = Some(e.to_string());
                    })
                    .await?;
                    blocked.insert(op.target_collection.clone());
                    report.failed.push(id);
                }
                Err(e) => {
                    let attempts = op.attempt_count + 1;
                    let exhausted = self.retry.is_exhausted(attempts);
                    let next = self.retry.next_attempt_at(now, attempts);
                    self.update(&id, |op| {
                        op.attempt_count = attempts;
                        if exhausted {
                            op.status = OperationStatus::Failed;
                            op.next_attempt_at = None;
                            op.last_error = Some(
                                Error::RetryExhausted(format!("{} attempts, last: {}", attempts, e))
                                    .to_string(),
                            );
                        } else {
                            op.last_error = Some(e.to_string());
                            op.status = OperationStatus::Pending;
                            op.next_attempt_at = Some(next);
                        }
                    })
                    .await?;

                    if exhausted {
                        error!(
                            "Giving up on {} on {} ({}) after {} attempts: {}",
                            op.kind, op.target_collection, id, attempts, e
                        );
                        report.failed.push(id);
                    } else {
                        warn!(
                            "Attempt {} of {} on {} failed, retrying later: {}",
                            attempts, op.kind, op.target_collection, e
                        );
                        report.retried += 1;
                    }
                    blocked.insert(op.target_collection.clone());
                }
            }
        }

        if report.applied_any() || !report.failed.is_empty() {
            info!(
                "Drain: {} applied, {} retrying, {} failed, {} deferred",
                report.applied.len(),
                report.retried,
                report.failed.len(),
                report.deferred
            );
        }
        Ok(report)
    }

    /// Whether an operation not yet applied targets `collection`.
    pub async fn has_pending_for(&self, collection: &CollectionName) -> bool {
        self.ops
            .read()
            .await
            .iter()
            .any(|op| op.is_waiting() && &op.target_collection == collection)
    }

    /// Pending and in-flight operations, in queue order.
    pub async fn get_pending(&self) -> Vec<OfflineOperation> {
        self.filtered(OfflineOperation::is_waiting).await
    }

    /// Terminally failed operations, in queue order.
    pub async fn get_failed(&self) -> Vec<OfflineOperation> {
        self.filtered(|op| op.status == OperationStatus::Failed).await
    }

    /// Put a failed operation back in line with a fresh retry budget.
    ///
    /// # Errors
    /// - `NotFound` if there is no failed operation with this id
    pub async fn retry_failed(&self, id: &str) -> Result<OfflineOperation> {
        let _gate = self.write_gate.lock().await;
        let mut updated: Vec<OfflineOperation> = self.ops.read().await.iter().cloned().collect();

        let op = updated
            .iter_mut()
            .find(|op| op.id == id && op.status == OperationStatus::Failed)
            .ok_or_else(|| Error::NotFound(format!("No failed operation {}", id)))?;
        op.status = OperationStatus::Pending;
        op.attempt_count = 0;
        op.next_attempt_at = None;
        let op = op.clone();

        self.publish(updated).await?;
        info!("Operation {} reset for retry", id);
        Ok(op)
    }

    /// Drop every failed operation. Returns how many were removed.
    pub async fn clear_failed(&self) -> Result<usize> {
        let _gate = self.write_gate.lock().await;
        let current = self.ops.read().await.clone();
        let updated: Vec<OfflineOperation> = current
            .iter()
            .filter(|op| op.status != OperationStatus::Failed)
            .cloned()
            .collect();

        let removed = current.len() - updated.len();
        if removed > 0 {
            self.publish(updated).await?;
            info!("Cleared {} failed operations", removed);
        }
        Ok(removed)
    }

    pub async fn len(&self) -> usize {
        self.ops.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.ops.read().await.is_empty()
    }

    async fn filtered(&self, keep: impl Fn(&OfflineOperation) -> bool) -> Vec<OfflineOperation> {
        let ops = self.ops.read().await.clone();
        ops.iter().filter(|op| keep(op)).cloned().collect()
    }

    async fn find(&self, id: &str) -> Option<OfflineOperation> {
        self.ops.read().await.iter().find(|op| op.id == id).cloned()
    }

    /// Apply a transition and persist it. On a failed write the in-memory
    /// queue is left as it was.
    async fn update(&self, id: &str, change: impl FnOnce(&mut OfflineOperation)) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let mut updated: Vec<OfflineOperation> = self.ops.read().await.iter().cloned().collect();
        if let Some(op) = updated.iter_mut().find(|op| op.id == id) {
            change(op);
        }
        self.publish(updated).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let updated: Vec<OfflineOperation> = self
            .ops
            .read()
            .await
            .iter()
            .filter(|op| op.id != id)
            .cloned()
            .collect();
        self.publish(updated).await
    }

    async fn publish(&self, updated: Vec<OfflineOperation>) -> Result<()> {
        if let Err(e) = save_record(self.store.as_ref(), keys::OFFLINE_QUEUE, &updated).await {
            error!("Failed to persist offline queue: {}", e);
            return Err(e);
        }
        *self.ops.write().await = Arc::new(updated);
        Ok(())
    }
}
