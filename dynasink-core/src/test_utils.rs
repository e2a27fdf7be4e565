//! In-memory store and source used by the unit tests.
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::checkpoint::AckFrontier;
use crate::error::Result;
use crate::mapper::AttributeMap;
use crate::message::{Offset, PartitionId, RawRecord};
use crate::schema::AttributeKind;
use crate::source::RecordSource;
use crate::store::{StoreError, TableDescriptor, TableStore};

#[derive(Default)]
struct StoreState {
    tables: HashMap<String, TableDescriptor>,
    /// table -> key -> item
    items: HashMap<String, BTreeMap<String, AttributeMap>>,
    describe_error: Option<StoreError>,
    describe_calls: usize,
    /// Errors returned, in order, for puts of the item with the given key.
    put_failures: HashMap<String, VecDeque<StoreError>>,
    put_calls: usize,
    put_delay: Option<Duration>,
}

/// Last-write-wins table store kept in memory. The first attribute of a table is its key.
#[derive(Clone, Default)]
pub(crate) struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub(crate) fn with_table(table: &str, attributes: &[(&str, AttributeKind)]) -> Self {
        let store = Self::default();
        let descriptor = TableDescriptor {
            table: table.to_string(),
            attributes: attributes
                .iter()
                .map(|(name, kind)| (name.to_string(), *kind))
                .collect(),
            key_attributes: attributes
                .first()
                .map(|(name, _)| vec![name.to_string()])
                .unwrap_or_default(),
        };
        store
            .state
            .lock()
            .unwrap()
            .tables
            .insert(table.to_string(), descriptor);
        store
    }

    pub(crate) fn fail_describe(&self, error: StoreError) {
        self.state.lock().unwrap().describe_error = Some(error);
    }

    pub(crate) fn fail_puts(&self, key: &str, errors: Vec<StoreError>) {
        self.state
            .lock()
            .unwrap()
            .put_failures
            .insert(key.to_string(), errors.into());
    }

    pub(crate) fn set_put_delay(&self, delay: Duration) {
        self.state.lock().unwrap().put_delay = Some(delay);
    }

    pub(crate) fn describe_calls(&self) -> usize {
        self.state.lock().unwrap().describe_calls
    }

    pub(crate) fn put_calls(&self) -> usize {
        self.state.lock().unwrap().put_calls
    }

    pub(crate) fn item(&self, table: &str, key: &str) -> Option<AttributeMap> {
        self.state
            .lock()
            .unwrap()
            .items
            .get(table)
            .and_then(|items| items.get(key).cloned())
    }

    pub(crate) fn item_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .items
            .get(table)
            .map_or(0, BTreeMap::len)
    }

    /// Every item of the table, by key.
    pub(crate) fn snapshot(&self, table: &str) -> BTreeMap<String, AttributeMap> {
        self.state
            .lock()
            .unwrap()
            .items
            .get(table)
            .cloned()
            .unwrap_or_default()
    }
}

impl TableStore for InMemoryStore {
    async fn describe_table(&self, table: &str) -> std::result::Result<TableDescriptor, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.describe_calls += 1;
        if let Some(error) = state.describe_error.clone() {
            return Err(error);
        }
        state
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("table {table} not found")))
    }

    async fn put_item(&self, table: &str, item: &AttributeMap) -> std::result::Result<(), StoreError> {
        let delay = self.state.lock().unwrap().put_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.put_calls += 1;
        let descriptor = state
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("table {table} not found")))?;
        let key = descriptor
            .key_attributes
            .iter()
            .map(|name| item.get(name).map(|scalar| scalar.value.clone()))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| StoreError::permanent("item is missing its key"))?
            .join("|");

        if let Some(error) = state
            .put_failures
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        state
            .items
            .entry(table.to_string())
            .or_default()
            .insert(key, item.clone());
        Ok(())
    }
}

#[derive(Default)]
struct LogState {
    /// The offset of a record is its index in the partition.
    partitions: BTreeMap<PartitionId, Vec<RawRecord>>,
    positions: HashMap<PartitionId, usize>,
    /// Next offset to read per partition, as committed by acks.
    committed: HashMap<PartitionId, Offset>,
    rewinds: Vec<(PartitionId, Offset)>,
    paused: HashSet<PartitionId>,
    /// Partitions no longer owned. They are never read again.
    revoked: HashSet<PartitionId>,
    pending_revocations: Vec<PartitionId>,
    fail_acks: bool,
}

/// Partitioned log kept in memory. Reads advance a per-partition position which `rewind` moves
/// back.
#[derive(Clone, Default)]
pub(crate) struct InMemorySource {
    state: Arc<Mutex<LogState>>,
    batch_size: usize,
}

impl InMemorySource {
    pub(crate) fn new(batch_size: usize) -> Self {
        Self {
            state: Arc::default(),
            batch_size,
        }
    }

    pub(crate) fn append(&self, partition: PartitionId, payloads: &[&str]) {
        let mut state = self.state.lock().unwrap();
        let records = state.partitions.entry(partition).or_default();
        for payload in payloads {
            let offset = records.len() as Offset;
            records.push(RawRecord::new(partition, offset, payload.to_string()));
        }
    }

    pub(crate) fn fail_acks(&self, fail: bool) {
        self.state.lock().unwrap().fail_acks = fail;
    }

    pub(crate) fn committed(&self, partition: PartitionId) -> Option<Offset> {
        self.state.lock().unwrap().committed.get(&partition).copied()
    }

    pub(crate) fn rewinds(&self) -> Vec<(PartitionId, Offset)> {
        self.state.lock().unwrap().rewinds.clone()
    }

    /// Takes `partition` away, as a rebalance would.
    pub(crate) fn revoke(&self, partition: PartitionId) {
        let mut state = self.state.lock().unwrap();
        state.revoked.insert(partition);
        state.paused.remove(&partition);
        state.pending_revocations.push(partition);
    }

    /// Hands `partition` back, reading from `offset` which is also taken as committed.
    pub(crate) fn reassign(&self, partition: PartitionId, offset: Offset) {
        let mut state = self.state.lock().unwrap();
        state.revoked.remove(&partition);
        state.positions.insert(partition, offset as usize);
        state.committed.insert(partition, offset);
    }
}

impl RecordSource for InMemorySource {
    async fn read(&mut self) -> Result<Vec<RawRecord>> {
        let batch = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let mut batch = Vec::new();
            for (partition, records) in &state.partitions {
                if state.paused.contains(partition) || state.revoked.contains(partition) {
                    continue;
                }
                let position = state.positions.entry(*partition).or_default();
                while batch.len() < self.batch_size {
                    let Some(record) = records.get(*position) else {
                        break;
                    };
                    batch.push(record.clone());
                    *position += 1;
                }
            }
            batch
        };
        if batch.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(batch)
    }

    async fn ack(&mut self, frontier: &AckFrontier) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_acks {
            return Err(crate::Error::Source("ack refused".to_string()));
        }
        for (partition, offset) in frontier.acknowledged() {
            state.committed.insert(*partition, offset + 1);
        }
        Ok(())
    }

    async fn rewind(&mut self, partition: PartitionId, offset: Offset) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.revoked.contains(&partition) {
            return Err(crate::Error::Source(format!("partition {partition} is not assigned")));
        }
        state.rewinds.push((partition, offset));
        state.positions.insert(partition, offset as usize);
        Ok(())
    }

    async fn pause(&mut self, partitions: &[PartitionId]) -> Result<()> {
        self.state.lock().unwrap().paused.extend(partitions);
        Ok(())
    }

    async fn resume(&mut self, partitions: &[PartitionId]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for partition in partitions {
            state.paused.remove(partition);
        }
        Ok(())
    }

    async fn revoked(&mut self) -> Result<Vec<PartitionId>> {
        Ok(std::mem::take(
            &mut self.state.lock().unwrap().pending_revocations,
        ))
    }
}
