use std::collections::BTreeMap;

use futures::channel::oneshot;

use crate::api::client::{DocSyncClient, PendingWrite};
use crate::api::user_data::{parse_set_data, parse_update_data, SetOptions};
use crate::error::{resource_exhausted, SyncResult};
use crate::model::{DocumentKey, Mutation, BATCH_ID_UNKNOWN};
use crate::value::Value;

const MAX_BATCH_WRITES: usize = 500;

/// Collects writes that are applied and committed as one batch.
pub struct WriteBatch {
    client: DocSyncClient,
    mutations: Vec<Mutation>,
}

impl WriteBatch {
    pub(crate) fn new(client: DocSyncClient) -> Self {
        Self {
            client,
            mutations: Vec::new(),
        }
    }

    pub fn set(
        &mut self,
        key: &DocumentKey,
        data: BTreeMap<String, Value>,
        options: SetOptions,
    ) -> SyncResult<&mut Self> {
        self.ensure_capacity()?;
        self.mutations.push(parse_set_data(key.clone(), data, &options)?);
        Ok(self)
    }

    pub fn update(&mut self, key: &DocumentKey, fields: BTreeMap<String, Value>) -> SyncResult<&mut Self> {
        self.ensure_capacity()?;
        self.mutations.push(parse_update_data(key.clone(), fields)?);
        Ok(self)
    }

    pub fn delete(&mut self, key: &DocumentKey) -> SyncResult<&mut Self> {
        self.ensure_capacity()?;
        self.mutations.push(Mutation::delete(key.clone()));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Applies every write locally as one batch. An empty batch is
    /// acknowledged right away.
    pub async fn commit(self) -> SyncResult<PendingWrite> {
        if self.mutations.is_empty() {
            let (sender, receiver) = oneshot::channel();
            let _ = sender.send(Ok(()));
            return Ok(PendingWrite::new(BATCH_ID_UNKNOWN, receiver));
        }
        self.client.write(self.mutations).await
    }

    fn ensure_capacity(&self) -> SyncResult<()> {
        if self.mutations.len() >= MAX_BATCH_WRITES {
            return Err(resource_exhausted(format!(
                "A write batch cannot contain more than {MAX_BATCH_WRITES} writes"
            )));
        }
        Ok(())
    }
}
