//! In-process external store used for tests and local development

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{AuthContext, ExternalError, ExternalErrorKind, ExternalResourceClient};
use crate::models::{ProductFields, ProductId, ProductRecord};

/// An external product store held in memory.
///
/// Behaves like the real platform where it matters to the engine: ids and
/// version tokens are assigned here, creates are deduplicated by
/// idempotency key, and failed calls leave no trace. Failures can be
/// injected with [`InMemoryExternal::fail_next`], and
/// [`InMemoryExternal::lose_create_responses`] models a create that was
/// applied but never answered.
#[derive(Default)]
pub struct InMemoryExternal {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    products: BTreeMap<ProductId, ProductRecord>,
    idempotency: HashMap<String, ProductId>,
    injected: VecDeque<ExternalErrorKind>,
    lost_create_responses: usize,
    ignore_keys: bool,
    next_id: u64,
    next_version: u64,
    mutations: u64,
}

impl MemoryState {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn insert(&mut self, fields: &ProductFields) -> ProductRecord {
        self.next_id += 1;
        let record = ProductRecord {
            id: ProductId::new((1_000 + self.next_id).to_string()),
            title: fields.title.clone(),
            description: fields.description.clone(),
            price: fields.price,
            vendor: fields.vendor.clone(),
            external_version: Some(self.bump_version()),
        };
        self.products.insert(record.id.clone(), record.clone());
        record
    }

    fn take_injected(&mut self) -> Result<(), ExternalError> {
        match self.injected.pop_front() {
            Some(ExternalErrorKind::Transient) => {
                Err(ExternalError::from_status(503, "injected transient failure"))
            }
            Some(ExternalErrorKind::Permanent) => {
                Err(ExternalError::from_status(422, "injected permanent failure"))
            }
            None => Ok(()),
        }
    }
}

fn reject_invalid(fields: &ProductFields) -> Result<(), ExternalError> {
    if fields.title.trim().is_empty() {
        return Err(ExternalError::from_status(422, "title can't be blank"));
    }
    if fields.price.is_negative() {
        return Err(ExternalError::from_status(
            422,
            "price must be greater than or equal to 0",
        ));
    }
    Ok(())
}

impl InMemoryExternal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with `kind`
    pub async fn fail_next(&self, count: usize, kind: ExternalErrorKind) {
        let mut state = self.state.lock().await;
        state.injected.extend(std::iter::repeat(kind).take(count));
    }

    /// Apply the next `count` creates but answer each with a timeout
    pub async fn lose_create_responses(&self, count: usize) {
        self.state.lock().await.lost_create_responses += count;
    }

    /// Stop deduplicating creates by key, like a store that ignores the
    /// idempotency header. Keys are still recorded for `find_created`.
    pub async fn ignore_idempotency_keys(&self) {
        self.state.lock().await.ignore_keys = true;
    }

    /// Add a product directly, bypassing the client surface
    pub async fn seed(&self, fields: ProductFields) -> ProductRecord {
        self.state.lock().await.insert(&fields)
    }

    /// Edit a product directly, as another admin tool would
    pub async fn edit(&self, id: &ProductId, fields: ProductFields) -> Option<ProductRecord> {
        let mut state = self.state.lock().await;
        let version = state.bump_version();
        let record = state.products.get_mut(id)?;
        record.title = fields.title;
        record.description = fields.description;
        record.price = fields.price;
        record.vendor = fields.vendor;
        record.external_version = Some(version);
        Some(record.clone())
    }

    /// Remove a product directly
    pub async fn remove(&self, id: &ProductId) -> Option<ProductRecord> {
        self.state.lock().await.products.remove(id)
    }

    /// Current contents ordered by id
    pub async fn snapshot(&self) -> Vec<ProductRecord> {
        self.state.lock().await.products.values().cloned().collect()
    }

    /// Number of successful create/update/delete calls
    pub async fn mutation_count(&self) -> u64 {
        self.state.lock().await.mutations
    }
}

#[async_trait]
impl ExternalResourceClient for InMemoryExternal {
    async fn create(
        &self,
        _ctx: &AuthContext,
        idempotency_key: &str,
        fields: &ProductFields,
    ) -> Result<ProductRecord, ExternalError> {
        let mut state = self.state.lock().await;
        state.take_injected()?;

        if !state.ignore_keys {
            if let Some(id) = state.idempotency.get(idempotency_key) {
                if let Some(existing) = state.products.get(id) {
                    return Ok(existing.clone());
                }
            }
        }

        reject_invalid(fields)?;
        let record = state.insert(fields);
        state
            .idempotency
            .insert(idempotency_key.to_string(), record.id.clone());
        state.mutations += 1;

        if state.lost_create_responses > 0 {
            state.lost_create_responses -= 1;
            return Err(ExternalError::transient(
                "create applied but the response was lost",
            ));
        }
        Ok(record)
    }

    async fn find_created(
        &self,
        _ctx: &AuthContext,
        idempotency_key: &str,
    ) -> Result<Option<ProductRecord>, ExternalError> {
        let mut state = self.state.lock().await;
        state.take_injected()?;
        Ok(state
            .idempotency
            .get(idempotency_key)
            .and_then(|id| state.products.get(id))
            .cloned())
    }

    async fn update(
        &self,
        _ctx: &AuthContext,
        id: &ProductId,
        fields: &ProductFields,
    ) -> Result<ProductRecord, ExternalError> {
        let mut state = self.state.lock().await;
        state.take_injected()?;
        reject_invalid(fields)?;

        if !state.products.contains_key(id) {
            return Err(ExternalError::not_found(id));
        }
        let version = state.bump_version();
        let record = state
            .products
            .get_mut(id)
            .ok_or_else(|| ExternalError::not_found(id))?;
        record.title.clone_from(&fields.title);
        record.description.clone_from(&fields.description);
        record.price = fields.price;
        record.vendor.clone_from(&fields.vendor);
        record.external_version = Some(version);
        let updated = record.clone();
        state.mutations += 1;
        Ok(updated)
    }

    async fn delete(&self, _ctx: &AuthContext, id: &ProductId) -> Result<(), ExternalError> {
        let mut state = self.state.lock().await;
        state.take_injected()?;

        if state.products.remove(id).is_none() {
            return Err(ExternalError::not_found(id));
        }
        state.mutations += 1;
        Ok(())
    }

    async fn get(&self, _ctx: &AuthContext, id: &ProductId) -> Result<ProductRecord, ExternalError> {
        let mut state = self.state.lock().await;
        state.take_injected()?;
        state
            .products
            .get(id)
            .cloned()
            .ok_or_else(|| ExternalError::not_found(id))
    }

    async fn list(&self, _ctx: &AuthContext) -> Result<Vec<ProductRecord>, ExternalError> {
        let mut state = self.state.lock().await;
        state.take_injected()?;
        Ok(state.products.values().cloned().collect())
    }
}
