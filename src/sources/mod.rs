//! External data sources
//!
//! A [`SourceClient`] is the only seam between the engine and the outside
//! world for retrieval. Clients return loosely-typed [`RawRecord`]s; the
//! agents normalize them into evidence.
//!
//! Bundled clients:
//! - `fixture` - in-memory records, optionally loaded from a JSON file
//! - `gateway` - generic JSON-over-HTTP integration layer

pub mod fixture;
pub mod gateway;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::evidence::{EntityKind, SourceCategory, SourceId};
use crate::types::CallFailure;

pub use fixture::{FixtureFile, FixtureSource};
pub use gateway::{gateway_registry, GatewaySource};

/// Query parameters, sorted by key so identical queries fingerprint identically.
pub type QueryParams = BTreeMap<String, String>;

/// One record as returned by a source, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Entity the record is about, when the source knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_kind: Option<EntityKind>,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl RawRecord {
    pub fn new(subject: impl Into<String>, kind: EntityKind) -> Self {
        Self { subject: Some(subject.into()), subject_kind: Some(kind), fields: serde_json::Map::new() }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str()).map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn f64_field(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(|v| match v {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn u32_field(&self, key: &str) -> Option<u32> {
        self.f64_field(key).filter(|v| *v >= 0.0).map(|v| v.round() as u32)
    }

    pub fn i32_field(&self, key: &str) -> Option<i32> {
        self.f64_field(key).map(|v| v.round() as i32)
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(|v| match v {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        })
    }
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Run one query. Implementations must return `CallFailure::cancelled()`
    /// promptly once `cancel` fires.
    async fn query(
        &self,
        params: &QueryParams,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawRecord>, CallFailure>;
}

/// A source registered with the engine.
#[derive(Clone)]
pub struct SourceBinding {
    pub id: SourceId,
    pub category: SourceCategory,
    pub client: Arc<dyn SourceClient>,
    /// How long successful responses stay cached.
    pub ttl: Duration,
}

impl std::fmt::Debug for SourceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceBinding")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[derive(Clone, Default, Debug)]
pub struct SourceRegistry {
    bindings: BTreeMap<SourceId, SourceBinding>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, binding: SourceBinding) -> &mut Self {
        self.bindings.insert(binding.id.clone(), binding);
        self
    }

    pub fn with_source(
        mut self,
        id: impl Into<SourceId>,
        category: SourceCategory,
        client: Arc<dyn SourceClient>,
        ttl: Duration,
    ) -> Self {
        self.register(SourceBinding { id: id.into(), category, client, ttl });
        self
    }

    pub fn get(&self, id: &SourceId) -> Option<&SourceBinding> {
        self.bindings.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &SourceId> {
        self.bindings.keys()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Sources of `category` that the intent selected, in id order.
    pub fn selected(&self, category: SourceCategory, selected: &BTreeSet<SourceId>) -> Vec<SourceBinding> {
        self.bindings
            .values()
            .filter(|b| b.category == category && selected.contains(&b.id))
            .cloned()
            .collect()
    }
}
