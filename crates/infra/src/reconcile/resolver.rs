//! Surrogate key resolution for entity dependencies.
//!
//! Each dependency declares its policy in the entity schema:
//!
//! - **Hard**: unresolved fails the whole upsert.
//! - **Soft**: unresolved substitutes the configured default for the target
//!   kind and logs a warning.
//! - **Optional**: unresolved leaves the column untouched.

use std::collections::HashMap;

use tracing::{debug, warn};

use ledgersync_core::{EntityKind, ExternalId, SurrogateId};
use ledgersync_ledger::{DependencyPolicy, DependencySpec, soft_dependencies};

use super::ReconcileError;
use crate::store::{LedgerTx, RowLock};

/// How one reference was resolved.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(SurrogateId),
    /// The configured default for an unresolved soft dependency.
    Defaulted(SurrogateId),
    /// An unresolved optional dependency; nothing to write.
    Unset,
}

impl Resolution {
    pub fn surrogate_id(self) -> Option<SurrogateId> {
        match self {
            Resolution::Found(id) | Resolution::Defaulted(id) => Some(id),
            Resolution::Unset => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("soft dependency {kind}.{dependency} has no default {target} configured")]
    MissingDefault {
        kind: EntityKind,
        dependency: &'static str,
        target: EntityKind,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SurrogateKeyResolver {
    defaults: HashMap<EntityKind, SurrogateId>,
}

impl SurrogateKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default substituted for unresolved soft references to `target`.
    pub fn with_default(mut self, target: EntityKind, id: SurrogateId) -> Self {
        self.defaults.insert(target, id);
        self
    }

    pub fn default_for(&self, target: EntityKind) -> Option<SurrogateId> {
        self.defaults.get(&target).copied()
    }

    /// Check that every soft dependency in the catalogue has a default.
    pub fn validate(&self) -> Result<(), ResolverError> {
        for (kind, dep) in soft_dependencies() {
            if !self.defaults.contains_key(&dep.target) {
                return Err(ResolverError::MissingDefault {
                    kind,
                    dependency: dep.name,
                    target: dep.target,
                });
            }
        }
        Ok(())
    }

    /// Resolve `external_id` for `dependency` within the caller's transaction.
    pub async fn resolve(
        &self,
        tx: &mut dyn LedgerTx,
        dependency: &'static DependencySpec,
        external_id: &ExternalId,
    ) -> Result<Resolution, ReconcileError> {
        if let Some(row) = tx
            .find_by_external(dependency.target, external_id, RowLock::KeyShare)
            .await? {
            return Ok(Resolution::Found(row.id));
        }

        match dependency.policy {
            DependencyPolicy::Hard => Err(ReconcileError::UnresolvedHardDependency {
                dependency: dependency.name,
                target: dependency.target,
                external_id: external_id.clone(),
            }),
            DependencyPolicy::Soft => {
                let default = self.default_for(dependency.target).ok_or(
                    ReconcileError::MissingDefault {
                        dependency: dependency.name,
                        target: dependency.target,
                    },
                )?;
                warn!(
                    dependency = dependency.name,
                    target = %dependency.target,
                    external_id = %external_id,
                    default = %default,
                    "unresolved soft dependency; substituting default"
                );
                Ok(Resolution::Defaulted(default))
            }
            DependencyPolicy::Optional => {
                debug!(
                    dependency = dependency.name,
                    target = %dependency.target,
                    external_id = %external_id,
                    "unresolved optional dependency; column left untouched"
                );
                Ok(Resolution::Unset)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryLedgerStore, LedgerStore};
    use ledgersync_ledger::{FieldChanges, schema};

    fn ext(value: &str) -> ExternalId {
        ExternalId::parse(value).unwrap()
    }

    fn dependency(kind: EntityKind, name: &str) -> &'static DependencySpec {
        schema(kind).dependency(name).unwrap()
    }

    #[tokio::test]
    async fn existing_targets_resolve_to_their_surrogate_id() {
        let store = InMemoryLedgerStore::new();
        let id = store
            .seed(EntityKind::PurchaseOrder, ext("123"), FieldChanges::new())
            .await;

        let mut tx = store.begin().await.unwrap();
        let resolution = SurrogateKeyResolver::new()
            .resolve(tx.as_mut(), dependency(EntityKind::DetailItem, "parent"), &ext("123"))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Found(id));
    }

    #[tokio::test]
    async fn unresolved_hard_dependency_fails() {
        let store = InMemoryLedgerStore::new();
        let mut tx = store.begin().await.unwrap();
        let err = SurrogateKeyResolver::new()
            .resolve(tx.as_mut(), dependency(EntityKind::DetailItem, "parent"), &ext("123"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::UnresolvedHardDependency { target: EntityKind::PurchaseOrder, .. }
        ));
    }

    #[tokio::test]
    async fn unresolved_soft_dependency_takes_the_default() {
        let store = InMemoryLedgerStore::new();
        let resolver = SurrogateKeyResolver::new()
            .with_default(EntityKind::AccountCode, SurrogateId::new(5000));
        let mut tx = store.begin().await.unwrap();
        let resolution = resolver
            .resolve(
                tx.as_mut(),
                dependency(EntityKind::DetailItem, "account_code"),
                &ext("9999"),
            )
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Defaulted(SurrogateId::new(5000)));
    }

    #[tokio::test]
    async fn unresolved_optional_dependency_is_unset() {
        let store = InMemoryLedgerStore::new();
        let mut tx = store.begin().await.unwrap();
        let resolution = SurrogateKeyResolver::new()
            .resolve(
                tx.as_mut(),
                dependency(EntityKind::PurchaseOrder, "contact"),
                &ext("55"),
            )
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Unset);
        assert_eq!(resolution.surrogate_id(), None);
    }

    #[test]
    fn validation_requires_a_default_per_soft_target() {
        assert!(matches!(
            SurrogateKeyResolver::new().validate(),
            Err(ResolverError::MissingDefault { target: EntityKind::AccountCode, .. })
        ));
        assert!(SurrogateKeyResolver::new()
            .with_default(EntityKind::AccountCode, SurrogateId::new(1))
            .validate()
            .is_ok());
    }
}
