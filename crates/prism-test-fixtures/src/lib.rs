//! Shared fixtures for PrismDB integration tests.
//!
//! Provides a small workforce-management schema (the kind of application
//! the engine is built for), an assembled in-memory engine, and memory
//! implementations of the identity and permission traits.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use prism_core::{
    AuthUser, Engine, EngineContext, IdentityProvider, IdentityState, PermissionSource,
    ShardMap,
};
use prism_store::{DocumentStore, MemoryBackend};
use prism_types::{
    Collection, CollectionGrant, EngineLimits, Field, FieldType, PermissionRecord,
    RelationMeta, Schema,
};

pub mod schema;

pub use schema::workforce_schema;

/// Identity backend over a shared map, for coordinator and engine tests.
#[derive(Default)]
pub struct MemoryIdentityProvider {
    states: Mutex<BTreeMap<String, IdentityState>>,
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_of(&self, record_id: &str) -> IdentityState {
        self.states
            .lock()
            .expect("identity map poisoned")
            .get(record_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn current(&self, record_id: &str) -> prism_core::Result<IdentityState> {
        Ok(self.state_of(record_id))
    }

    async fn apply(&self, record_id: &str, state: &IdentityState) -> prism_core::Result<()> {
        self.states
            .lock()
            .expect("identity map poisoned")
            .insert(record_id.to_string(), state.clone());
        Ok(())
    }
}

/// Permission source over a static user-id map.
#[derive(Default)]
pub struct MemoryPermissionSource {
    records: Mutex<BTreeMap<String, PermissionRecord>>,
}

impl MemoryPermissionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: PermissionRecord) {
        self.records
            .lock()
            .expect("permission map poisoned")
            .insert(record.user_id.clone(), record);
    }
}

#[async_trait]
impl PermissionSource for MemoryPermissionSource {
    async fn permissions_for(
        &self,
        _tenant: &str,
        user_id: &str,
    ) -> prism_core::Result<Option<PermissionRecord>> {
        Ok(self
            .records
            .lock()
            .expect("permission map poisoned")
            .get(user_id)
            .cloned())
    }
}

/// A fully assembled in-memory engine over the workforce schema.
pub struct EngineFixture {
    pub store: Arc<MemoryBackend>,
    pub engine: Engine,
    pub schema: Arc<Schema>,
    pub shards: Arc<ShardMap>,
    pub permissions: Arc<MemoryPermissionSource>,
    pub identity: Arc<MemoryIdentityProvider>,
    pub limits: EngineLimits,
}

impl EngineFixture {
    pub fn new() -> Self {
        Self::with_schema(workforce_schema())
    }

    pub fn with_schema(schema: Schema) -> Self {
        let store = Arc::new(MemoryBackend::new());
        let shards = Arc::new(ShardMap::build(&schema));
        let permissions = Arc::new(MemoryPermissionSource::new());
        let identity = Arc::new(MemoryIdentityProvider::new());
        let engine = Engine::new(
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            Arc::clone(&permissions) as Arc<dyn PermissionSource>,
            Some(Arc::clone(&identity) as Arc<dyn IdentityProvider>),
        );
        Self {
            store,
            engine,
            schema: Arc::new(schema),
            shards,
            permissions,
            identity,
            limits: EngineLimits::default(),
        }
    }

    /// Context for a trusted/internal caller.
    pub fn trusted(&self) -> EngineContext {
        self.context(None)
    }

    /// Context acting as `user_id` with `role`, with an unrestricted grant
    /// for every collection in the schema.
    pub fn user(&self, user_id: &str, role: &str) -> EngineContext {
        let mut record = PermissionRecord::new(user_id, role);
        for path in self.schema.collections.keys() {
            record = record.with_grant(
                path.clone(),
                CollectionGrant { unrestricted: true, ..CollectionGrant::default() },
            );
        }
        self.permissions.insert(record);
        self.context(Some(AuthUser::new(user_id, role)))
    }

    /// Context acting as `user_id` with `role` and an explicit permission
    /// record.
    pub fn user_with_permissions(
        &self,
        user_id: &str,
        role: &str,
        record: PermissionRecord,
    ) -> EngineContext {
        self.permissions.insert(record);
        self.context(Some(AuthUser::new(user_id, role)))
    }

    fn context(&self, user: Option<AuthUser>) -> EngineContext {
        EngineContext::new(
            "fixture-tenant",
            Arc::clone(&self.schema),
            Arc::clone(&self.shards),
            self.limits,
            user,
        )
    }
}

impl Default for EngineFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain typed field with identical read and write role lists.
pub fn plain_field(name: &str, field_type: FieldType, roles: &[&str]) -> Field {
    Field {
        name: name.to_string(),
        field_type,
        required: false,
        unique: false,
        read_access: roles.iter().map(|r| r.to_string()).collect(),
        write_access: roles.iter().map(|r| r.to_string()).collect(),
    }
}

/// Relation field with identical read and write role lists.
pub fn relation_field(name: &str, meta: RelationMeta, roles: &[&str]) -> Field {
    Field {
        name: name.to_string(),
        field_type: FieldType::Relation(meta),
        required: false,
        unique: false,
        read_access: roles.iter().map(|r| r.to_string()).collect(),
        write_access: roles.iter().map(|r| r.to_string()).collect(),
    }
}

/// Collection from a field list, with its role set inferred from the
/// fields' access tables.
pub fn collection(path: &str, fields: Vec<Field>) -> Collection {
    let mut roles: BTreeSet<String> = BTreeSet::new();
    for field in &fields {
        roles.extend(field.read_access.iter().cloned());
        roles.extend(field.write_access.iter().cloned());
    }
    Collection {
        path: path.to_string(),
        fields: fields.into_iter().map(|f| (f.name.clone(), f)).collect(),
        roles,
        identity_field: None,
        role_field: None,
    }
}
