//! The engine facade: `read`, `write`, `reconcile`.
//!
//! Components are assembled per call from the request context, so one
//! engine instance serves any number of tenants; all tenant-specific
//! state (schema, shard map, limits, acting user) travels in the
//! [`EngineContext`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, instrument};

use prism_store::DocumentStore;
use prism_types::record::FIELD_ID;
use prism_types::{ChangeEvent, PermissionRecord, Query, Record, Revision, Value};

use crate::context::EngineContext;
use crate::coordinator::{IdentityProvider, WriteCoordinator, WriteRequest};
use crate::planner::QueryPlanner;
use crate::propagator::DenormalizationPropagator;
use crate::reconcile::{ReconcileReport, ReconciliationWorker};
use crate::{EngineError, Result};

/// Where per-user permission snapshots come from. Loaded once per read;
/// the planner treats a missing record like a record with no grants.
#[async_trait]
pub trait PermissionSource: Send + Sync {
    async fn permissions_for(
        &self,
        tenant: &str,
        user_id: &str,
    ) -> Result<Option<PermissionRecord>>;
}

/// The engine's outer surface.
pub struct Engine {
    store: Arc<dyn DocumentStore>,
    permissions: Arc<dyn PermissionSource>,
    identity: Option<Arc<dyn IdentityProvider>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        permissions: Arc<dyn PermissionSource>,
        identity: Option<Arc<dyn IdentityProvider>>,
    ) -> Self {
        Self { store, permissions, identity }
    }

    /// Read every record of `collection_path` visible to the context's
    /// user. Trusted callers read the canonical collection; users read
    /// their role's shard under their permission restrictions.
    #[instrument(skip_all, fields(tenant = %ctx.tenant, collection = collection_path))]
    pub async fn read(&self, ctx: &EngineContext, collection_path: &str) -> Result<Vec<Record>> {
        let permissions = match &ctx.user {
            Some(user) => self.permissions.permissions_for(&ctx.tenant, &user.id).await?,
            None => None,
        };

        let planner = QueryPlanner::new(ctx.limits);
        let queries = planner.plan(ctx, collection_path, permissions.as_ref())?;
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let results = self.run_queries(ctx, queries).await?;
        debug!(count = results.len(), "Read complete");
        Ok(results)
    }

    /// Execute one logical write.
    pub async fn write(&self, ctx: &EngineContext, request: WriteRequest) -> Result<Record> {
        self.coordinator(ctx).write(ctx, request).await
    }

    /// Repair the drift one change event implies.
    pub async fn reconcile(
        &self,
        ctx: &EngineContext,
        event: &ChangeEvent,
    ) -> Result<ReconcileReport> {
        self.worker(ctx).reconcile(ctx, event).await
    }

    /// Drain the store's change log from `since` and reconcile each
    /// event in order. Returns the new cursor and the per-event reports.
    pub async fn reconcile_since(
        &self,
        ctx: &EngineContext,
        since: Revision,
    ) -> Result<(Revision, Vec<ReconcileReport>)> {
        let events = self.store.changes_since(since).await?;
        let worker = self.worker(ctx);
        let mut cursor = since;
        let mut reports = Vec::with_capacity(events.len());
        for event in &events {
            reports.push(worker.reconcile(ctx, event).await?);
            cursor = event.revision;
        }
        Ok((cursor, reports))
    }

    fn coordinator(&self, ctx: &EngineContext) -> WriteCoordinator {
        WriteCoordinator::new(
            Arc::clone(&self.store),
            DenormalizationPropagator::new(Arc::clone(&ctx.shards)),
            self.identity.clone(),
        )
    }

    fn worker(&self, ctx: &EngineContext) -> ReconciliationWorker {
        ReconciliationWorker::new(
            Arc::clone(&self.store),
            DenormalizationPropagator::new(Arc::clone(&ctx.shards)),
        )
    }

    /// Run the planned queries with bounded concurrency and merge the
    /// results, deduplicating records matched by more than one batch.
    async fn run_queries(&self, ctx: &EngineContext, queries: Vec<Query>) -> Result<Vec<Record>> {
        let store = Arc::clone(&self.store);
        let fetched: Vec<Result<Vec<prism_types::Document>>> = stream::iter(queries)
            .map(|query| {
                let store = Arc::clone(&store);
                async move { store.query(&query).await.map_err(EngineError::from) }
            })
            .buffer_unordered(ctx.limits.fanout_width)
            .collect()
            .await;

        let mut merged: BTreeMap<String, Record> = BTreeMap::new();
        for result in fetched {
            for doc in result? {
                let id = doc
                    .data
                    .get(FIELD_ID)
                    .and_then(Value::as_str)
                    .unwrap_or(doc.path.id.as_str())
                    .to_string();
                merged
                    .entry(id.clone())
                    .or_insert_with(|| Record::from_data(id, &doc.data));
            }
        }
        Ok(merged.into_values().collect())
    }
}
