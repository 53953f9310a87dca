//! Request-scoped engine context.
//!
//! Tenant id, schema handle, shard map, and acting user are threaded
//! explicitly through every call; the engine keeps no ambient state.

use std::sync::Arc;

use prism_types::{Collection, EngineLimits, Role, Schema, ValidationDetail};

use crate::rolegroup::ShardMap;
use crate::{EngineError, Result};

/// The authenticated user a request acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    pub role: Role,
}

impl AuthUser {
    pub fn new(id: impl Into<String>, role: impl Into<Role>) -> Self {
        Self { id: id.into(), role: role.into() }
    }
}

/// Everything one engine call needs to know about its surroundings.
#[derive(Clone)]
pub struct EngineContext {
    pub tenant: String,
    pub schema: Arc<Schema>,
    pub shards: Arc<ShardMap>,
    pub limits: EngineLimits,
    /// `None` means a trusted/internal caller: no permission gating.
    pub user: Option<AuthUser>,
}

impl EngineContext {
    pub fn new(
        tenant: impl Into<String>,
        schema: Arc<Schema>,
        shards: Arc<ShardMap>,
        limits: EngineLimits,
        user: Option<AuthUser>,
    ) -> Self {
        Self { tenant: tenant.into(), schema, shards, limits, user }
    }

    /// Look up a collection or fail with a validation error naming it.
    pub fn collection(&self, path: &str) -> Result<&Collection> {
        self.schema.collection(path).ok_or_else(|| {
            EngineError::Validation(ValidationDetail::record(path, "unknown collection"))
        })
    }

    /// Id recorded into audit fields for this request.
    pub fn actor_id(&self) -> &str {
        self.user.as_ref().map_or("system", |u| u.id.as_str())
    }
}
