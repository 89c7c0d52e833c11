use std::collections::BTreeMap;
use std::path::Path;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use flowrun_core::error::Result;
use flowrun_core::graph::Flow;
use flowrun_core::traits::FlowSource;
use flowrun_core::types::FlowSummary;

/// Read-only set of flow definitions, keyed by flow id.
#[derive(Debug, Clone, Default)]
pub struct FlowCatalog {
    flows: BTreeMap<String, Flow>,
}

impl FlowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_flows(flows: impl IntoIterator<Item = Flow>) -> Self {
        Self {
            flows: flows.into_iter().map(|f| (f.id.clone(), f)).collect(),
        }
    }

    /// Load every `.json` and `.toml` file in `dir`. Files that fail to
    /// parse are skipped with a warning; a missing directory yields an
    /// empty catalog.
    pub fn load_dir(dir: &Path) -> Self {
        let mut catalog = Self::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                debug!(path = %dir.display(), error = %e, "Cannot read flows directory");
                return catalog;
            }
        };

        let mut paths: Vec<_> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("json") | Some("toml")
                )
            })
            .collect();
        paths.sort();

        for path in paths {
            match Flow::load(&path) {
                Ok(flow) => {
                    if catalog.flows.contains_key(&flow.id) {
                        warn!(path = %path.display(), flow_id = %flow.id, "Duplicate flow id, keeping the first");
                        continue;
                    }
                    debug!(path = %path.display(), flow_id = %flow.id, "Loaded flow");
                    catalog.insert(flow);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to load flow");
                }
            }
        }

        info!(path = %dir.display(), count = catalog.len(), "Flow catalog loaded");
        catalog
    }

    pub fn insert(&mut self, flow: Flow) {
        self.flows.insert(flow.id.clone(), flow);
    }

    pub fn get(&self, id: &str) -> Option<&Flow> {
        self.flows.get(id)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

impl FlowSource for FlowCatalog {
    fn get_flow(&self, id: &str) -> BoxFuture<'_, Result<Option<Flow>>> {
        let flow = self.flows.get(id).cloned();
        Box::pin(async move { Ok(flow) })
    }

    fn list_flows(&self) -> BoxFuture<'_, Result<Vec<FlowSummary>>> {
        Box::pin(async move { Ok(self.flows.values().map(Flow::summary).collect()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_test_utils::{fan_out_flow, linear_flow, write_flow_dir};

    #[tokio::test]
    async fn test_load_dir_json_and_toml() {
        let dir = write_flow_dir(&[linear_flow(), fan_out_flow()]);
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = FlowCatalog::load_dir(dir.path());
        assert_eq!(catalog.len(), 2);

        let flow = catalog.get_flow("fan").await.unwrap().unwrap();
        assert_eq!(flow.steps.len(), 4);
        assert!(catalog.get_flow("broken").await.unwrap().is_none());

        let ids: Vec<String> = catalog
            .list_flows()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["fan", "linear"]);
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let catalog = FlowCatalog::load_dir(Path::new("/nonexistent/flowrun/flows"));
        assert!(catalog.is_empty());
    }
}
