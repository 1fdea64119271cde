use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use waterflow_core::error::{FlowError, Result};
use waterflow_core::traits::DefinitionRepository;
use waterflow_graph::Flow;

/// Flows by stream id, with their topologies published to the
/// definition repository.
pub struct FlowRegistry {
    flows: RwLock<HashMap<String, Arc<Flow>>>,
    definitions: Arc<dyn DefinitionRepository>,
}

impl FlowRegistry {
    pub fn new(definitions: Arc<dyn DefinitionRepository>) -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
            definitions,
        }
    }

    /// Validate and store the flow's definition, then make it routable.
    pub async fn register(&self, flow: Flow) -> Result<Arc<Flow>> {
        let definition = flow.definition();
        definition.validate()?;
        self.definitions.save(definition).await?;

        let flow = Arc::new(flow);
        self.flows
            .write()
            .map_err(|e| FlowError::Lock(e.to_string()))?
            .insert(flow.stream_id().to_string(), flow.clone());
        info!(stream_id = %flow.stream_id(), name = %flow.name(), "Flow registered");
        Ok(flow)
    }

    pub fn get(&self, stream_id: &str) -> Option<Arc<Flow>> {
        self.flows.read().ok()?.get(stream_id).cloned()
    }

    pub fn stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .flows
            .read()
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}
