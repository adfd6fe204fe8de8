//! In-memory index of enrolled identities.
//!
//! The gallery is shared between the capture loop (reads on every frame) and
//! command handlers (enroll/remove). Readers always get a point-in-time copy.

use crate::types::{Embedding, Identity, IdentityId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GalleryError {
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("identity already enrolled: {0}")]
    DuplicateIdentity(IdentityId),
    #[error("identity not found: {0}")]
    NotFound(IdentityId),
}

#[derive(Default)]
struct Inner {
    /// Insertion order, so snapshots are stable for callers.
    order: Vec<IdentityId>,
    entries: HashMap<IdentityId, Arc<Identity>>,
    /// Fixed by the first successful add.
    dimension: Option<usize>,
}

/// Thread-safe gallery of enrolled identities.
#[derive(Default)]
pub struct Gallery {
    inner: RwLock<Inner>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enroll a new identity.
    ///
    /// Fails without mutating the gallery if the id exists, no embeddings
    /// are given, or any embedding's dimension differs from the gallery's.
    pub fn add(
        &self,
        identity_id: &str,
        name: &str,
        embeddings: Vec<Embedding>,
    ) -> Result<(), GalleryError> {
        let mut inner = self.write();

        if inner.entries.contains_key(identity_id) {
            return Err(GalleryError::DuplicateIdentity(identity_id.to_string()));
        }
        let dim = check_references(identity_id, &embeddings, inner.dimension)?;

        inner.dimension = Some(dim);
        inner.order.push(identity_id.to_string());
        inner.entries.insert(
            identity_id.to_string(),
            Arc::new(Identity {
                id: identity_id.to_string(),
                name: name.to_string(),
                references: embeddings,
            }),
        );

        tracing::info!(identity = identity_id, dim, total = inner.order.len(), "identity enrolled");
        Ok(())
    }

    /// Remove an identity. Subsequent matches no longer see it.
    pub fn remove(&self, identity_id: &str) -> Result<Identity, GalleryError> {
        let mut inner = self.write();
        let removed = inner
            .entries
            .remove(identity_id)
            .ok_or_else(|| GalleryError::NotFound(identity_id.to_string()))?;
        inner.order.retain(|id| id != identity_id);

        tracing::info!(identity = identity_id, total = inner.order.len(), "identity removed");
        Ok(Arc::try_unwrap(removed).unwrap_or_else(|shared| Identity::clone(&shared)))
    }

    /// Replace the whole gallery atomically. On error the gallery is untouched.
    pub fn reload(&self, identities: Vec<Identity>) -> Result<(), GalleryError> {
        let mut seen = HashSet::new();
        let mut dimension = None;
        for identity in &identities {
            if !seen.insert(identity.id.as_str()) {
                return Err(GalleryError::DuplicateIdentity(identity.id.clone()));
            }
            dimension = Some(check_references(&identity.id, &identity.references, dimension)?);
        }

        let mut fresh = Inner { dimension, ..Default::default() };
        for identity in identities {
            fresh.order.push(identity.id.clone());
            fresh.entries.insert(identity.id.clone(), Arc::new(identity));
        }

        let mut inner = self.write();
        *inner = fresh;
        tracing::info!(total = inner.order.len(), dim = ?inner.dimension, "gallery reloaded");
        Ok(())
    }

    /// Point-in-time copy of every identity, in enrollment order.
    pub fn all(&self) -> Vec<Identity> {
        self.snapshot().iter().map(|i| Identity::clone(i)).collect()
    }

    /// Cheap point-in-time view used by the matcher on every probe.
    pub fn snapshot(&self) -> Vec<Arc<Identity>> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id).cloned())
            .collect()
    }

    pub fn contains(&self, identity_id: &str) -> bool {
        self.read().entries.contains_key(identity_id)
    }

    pub fn dimension(&self) -> Option<usize> {
        self.read().dimension
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A panic while holding the lock cannot leave `Inner` half-written:
    // every mutation builds its new state before touching it.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Validate reference embeddings, returning their common dimension.
fn check_references(
    identity_id: &str,
    embeddings: &[Embedding],
    expected: Option<usize>,
) -> Result<usize, GalleryError> {
    let first = embeddings.first().ok_or_else(|| {
        GalleryError::InvalidEmbedding(format!("{identity_id}: at least one reference embedding required"))
    })?;
    let dim = expected.unwrap_or(first.dim());
    if dim == 0 {
        return Err(GalleryError::InvalidEmbedding(format!("{identity_id}: empty embedding")));
    }

    for (i, e) in embeddings.iter().enumerate() {
        if e.dim() != dim {
            return Err(GalleryError::InvalidEmbedding(format!(
                "{identity_id}: reference {i} has dimension {}, gallery expects {dim}",
                e.dim()
            )));
        }
        if e.values.iter().any(|v| !v.is_finite()) {
            return Err(GalleryError::InvalidEmbedding(format!(
                "{identity_id}: reference {i} contains non-finite values"
            )));
        }
    }
    Ok(dim)
}
