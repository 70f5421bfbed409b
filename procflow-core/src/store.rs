use anyhow::{Context, Result};
use std::collections::BTreeMap;

use crate::node_instance::NodeInstanceRecord;
use crate::process_instance::ProcessInstanceRecord;
use crate::types::{NodeInstanceHandle, ProcessInstanceHandle};

/// Durable side of the engine. `EngineData::commit` writes every record a
/// transaction touched through this trait; the engine never reads back from
/// it while running.
pub trait EngineStore: Send {
    // ── Node instances ──

    fn put_node_instance(&mut self, record: &NodeInstanceRecord) -> Result<()>;
    fn node_instance(&self, handle: NodeInstanceHandle) -> Result<Option<NodeInstanceRecord>>;

    // ── Process instances ──

    fn put_process_instance(&mut self, record: &ProcessInstanceRecord) -> Result<()>;
    fn process_instance(
        &self,
        handle: ProcessInstanceHandle,
    ) -> Result<Option<ProcessInstanceRecord>>;
}

/// Keeps records as JSON text, so every commit exercises the full
/// serialize/deserialize path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    node_instances: BTreeMap<NodeInstanceHandle, String>,
    process_instances: BTreeMap<ProcessInstanceHandle, String>,
    writes: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of record writes since creation.
    pub fn writes(&self) -> u64 {
        self.writes
    }
}

impl EngineStore for MemoryStore {
    fn put_node_instance(&mut self, record: &NodeInstanceRecord) -> Result<()> {
        let json = serde_json::to_string(record)
            .with_context(|| format!("serializing node instance {}", record.handle))?;
        self.node_instances.insert(record.handle, json);
        self.writes += 1;
        Ok(())
    }

    fn node_instance(&self, handle: NodeInstanceHandle) -> Result<Option<NodeInstanceRecord>> {
        self.node_instances
            .get(&handle)
            .map(|json| {
                serde_json::from_str(json)
                    .with_context(|| format!("deserializing node instance {handle}"))
            })
            .transpose()
    }

    fn put_process_instance(&mut self, record: &ProcessInstanceRecord) -> Result<()> {
        let json = serde_json::to_string(record)
            .with_context(|| format!("serializing process instance {}", record.handle))?;
        self.process_instances.insert(record.handle, json);
        self.writes += 1;
        Ok(())
    }

    fn process_instance(
        &self,
        handle: ProcessInstanceHandle,
    ) -> Result<Option<ProcessInstanceRecord>> {
        self.process_instances
            .get(&handle)
            .map(|json| {
                serde_json::from_str(json)
                    .with_context(|| format!("deserializing process instance {handle}"))
            })
            .transpose()
    }
}
