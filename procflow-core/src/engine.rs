//! Transactional entry points. Every operation runs to completion against
//! the engine data and then commits, including when it fails, so recorded
//! failure state always reaches the store.

use std::sync::Arc;

use crate::authoring::{dto_to_model, parse_process_yaml};
use crate::config::EngineConfig;
use crate::engine_data::EngineData;
use crate::error::{EngineError, Result};
use crate::logging::init_tracing;
use crate::model::ExecutableProcessModel;
use crate::node_instance::{NodeInstance, NodeInstanceBuilder};
use crate::process_instance::{ProcessInstance, ProcessInstanceBuilder};
use crate::types::*;

#[derive(Debug, Default)]
pub struct ProcessEngine {
    data: EngineData,
}

impl ProcessEngine {
    pub fn new(data: EngineData) -> Self {
        Self { data }
    }

    /// Build an engine from configuration and install the tracing subscriber
    /// it names.
    pub fn from_config(config: EngineConfig) -> Self {
        init_tracing(&config.log_filter);
        Self::new(EngineData::new(config))
    }

    pub fn data(&self) -> &EngineData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut EngineData {
        &mut self.data
    }

    pub fn register_model(&mut self, model: ExecutableProcessModel) -> Arc<ExecutableProcessModel> {
        self.data.register_model(model)
    }

    /// Parse, validate and register a YAML process model. Composite nodes
    /// may reference any model registered before it.
    pub fn register_yaml(&mut self, yaml: &str) -> Result<Arc<ExecutableProcessModel>> {
        let model = parse_process_yaml(yaml)
            .and_then(|dto| dto_to_model(&dto, self.data.models()))
            .map_err(|err| EngineError::InvalidModel(format!("{err:#}")))?;
        Ok(self.register_model(model))
    }

    fn transaction<T>(&mut self, op: impl FnOnce(&mut EngineData) -> Result<T>) -> Result<T> {
        let result = op(&mut self.data);
        match self.data.commit() {
            Ok(_) => result,
            Err(commit_err) => match result {
                Ok(_) => Err(commit_err),
                Err(err) => {
                    tracing::error!(error = %commit_err, "commit after failed operation also failed");
                    Err(err)
                }
            },
        }
    }

    fn with_node<T>(
        &mut self,
        handle: NodeInstanceHandle,
        op: impl FnOnce(&mut NodeInstanceBuilder, &mut ProcessInstanceBuilder<'_>) -> Result<T>,
    ) -> Result<T> {
        self.transaction(|data| {
            let instance = data.node_instance(handle)?;
            let mut owner = ProcessInstanceBuilder::new(data, instance.process());
            let mut builder = NodeInstanceBuilder::from_instance(instance);
            op(&mut builder, &mut owner)
        })
    }

    // ── Processes ──

    /// Create and start an instance of a registered model.
    pub fn start_process(
        &mut self,
        model: &str,
        owner: Option<Principal>,
        inputs: Vec<ProcessData>,
    ) -> Result<ProcessInstanceHandle> {
        let model = self.data.model(model)?;
        let owner = owner.unwrap_or_else(|| self.data.config().default_owner());
        self.transaction(|data| {
            let name = model.name().to_string();
            let handle = data.create_process_instance(model, name, owner, None, inputs);
            tracing::info!(process = %handle, "starting process");
            ProcessInstanceBuilder::new(data, handle).start()?;
            Ok(handle)
        })
    }

    pub fn cancel_process(&mut self, handle: ProcessInstanceHandle) -> Result<()> {
        self.transaction(|data| ProcessInstanceBuilder::new(data, handle).cancel())
    }

    pub fn process_instance(&self, handle: ProcessInstanceHandle) -> Result<&ProcessInstance> {
        self.data.instance(handle)
    }

    // ── Tasks ──

    pub fn take_task(&mut self, handle: NodeInstanceHandle, user: Option<Principal>) -> Result<()> {
        self.with_node(handle, |node, owner| node.take_task(owner, user, false))
    }

    pub fn start_task(&mut self, handle: NodeInstanceHandle) -> Result<()> {
        self.with_node(handle, |node, owner| node.start_task(owner, true))
    }

    pub fn finish_task(
        &mut self,
        handle: NodeInstanceHandle,
        payload: Option<serde_json::Value>,
    ) -> Result<()> {
        self.with_node(handle, |node, owner| node.finish_task(owner, payload))
    }

    /// Cancel a task and skip downstream. Splits waiting on it are
    /// reconciled again, since a closed branch may decide them.
    pub fn cancel_task(&mut self, handle: NodeInstanceHandle) -> Result<()> {
        self.with_node(handle, |node, owner| {
            node.cancel_and_skip(owner)?;
            owner.update_splits()?;
            owner.update_state()
        })
    }

    pub fn fail_task(&mut self, handle: NodeInstanceHandle, cause: &str) -> Result<()> {
        self.with_node(handle, |node, owner| {
            node.fail_task(owner, cause)?;
            owner.update_splits()?;
            owner.update_state()
        })
    }

    pub fn tickle(&mut self, handle: NodeInstanceHandle) -> Result<()> {
        self.with_node(handle, |node, owner| node.tickle(owner))
    }

    /// Drain the tickle queue, at most `max_tickle_passes` times. Returns the
    /// number of tickles that succeeded; failures stay recorded on their
    /// instances. Instances no longer waiting for provisioning are dropped
    /// from the queue uncounted.
    pub fn run_tickles(&mut self) -> usize {
        let mut succeeded = 0;
        for _ in 0..self.data.config().max_tickle_passes {
            let queued = self.data.take_tickles();
            if queued.is_empty() {
                break;
            }
            for handle in queued {
                let waiting = self.data.node_instance(handle).is_ok_and(|instance| {
                    matches!(
                        instance.state(),
                        NodeInstanceState::Pending | NodeInstanceState::FailRetry
                    )
                });
                if !waiting {
                    tracing::debug!(%handle, "tickle dropped, instance no longer waiting");
                    continue;
                }
                match self.tickle(handle) {
                    Ok(()) => succeeded += 1,
                    Err(err) => tracing::warn!(%handle, error = %err, "tickle failed"),
                }
            }
        }
        succeeded
    }

    // ── Queries ──

    pub fn node_instance(&self, handle: NodeInstanceHandle) -> Result<Arc<NodeInstance>> {
        self.data.node_instance(handle)
    }

    pub fn children(&self, process: ProcessInstanceHandle) -> Result<Vec<Arc<NodeInstance>>> {
        self.data
            .instance(process)?
            .children()
            .iter()
            .map(|handle| self.data.node_instance(*handle))
            .collect()
    }

    /// Child instances of `process` waiting on an external actor.
    pub fn active_tasks(&self, process: ProcessInstanceHandle) -> Result<Vec<Arc<NodeInstance>>> {
        Ok(self
            .children(process)?
            .into_iter()
            .filter(|child| child.state().is_active() || child.state() == NodeInstanceState::FailRetry)
            .collect())
    }

    /// The live instance of `node` with the highest entry number.
    pub fn find_instance(
        &self,
        process: ProcessInstanceHandle,
        node: &str,
    ) -> Result<Option<Arc<NodeInstance>>> {
        Ok(self
            .children(process)?
            .into_iter()
            .filter(|child| {
                child.node().id.as_str() == node
                    && child.state() != NodeInstanceState::SkippedInvalidated
            })
            .max_by_key(|child| child.entry_no()))
    }
}
