//! Processor registry: maps (message type, organization scope) to a handler.
//!
//! Resolution checks the organization scope first and falls back to the
//! global scope. Plugins add and remove processors at runtime through
//! [`PluginEvent`]s; the registry remembers which types each plugin
//! contributed so a removal only touches those.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::handoff::processor::{HandoffProcessor, ProcessorMetadata};

/// Scope shared by every organization.
pub const GLOBAL_ORGANIZATION_SCOPE: &str = "*";

/// Strategy name carried by plugin events aimed at this registry.
pub const HANDOFF_PROCESSOR_STRATEGY: &str = "handoff-processor";

/// A processor together with the metadata it was registered under.
#[derive(Clone)]
pub struct ResolvedProcessor {
    pub message_type: String,
    pub organization_id: String,
    pub processor: Arc<dyn HandoffProcessor>,
    pub metadata: ProcessorMetadata,
}

impl std::fmt::Debug for ResolvedProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedProcessor")
            .field("message_type", &self.message_type)
            .field("organization_id", &self.organization_id)
            .field("processor", &self.processor.name())
            .field("policy", &self.metadata.policy)
            .finish()
    }
}

/// Runtime plugin lifecycle events.
#[derive(Clone)]
pub enum PluginEvent {
    Upsert {
        organization_id: String,
        plugin_name: String,
        /// Only events for [`HANDOFF_PROCESSOR_STRATEGY`] (or untagged) apply.
        strategy: Option<String>,
        processor: Arc<dyn HandoffProcessor>,
    },
    Remove {
        organization_id: String,
        plugin_name: String,
        strategy: Option<String>,
    },
}

impl PluginEvent {
    fn strategy(&self) -> Option<&str> {
        match self {
            Self::Upsert { strategy, .. } | Self::Remove { strategy, .. } => strategy.as_deref(),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    /// organization scope -> message type -> processor
    by_org: HashMap<String, HashMap<String, ResolvedProcessor>>,
    /// plugin -> organization scope -> types contributed
    plugin_types: HashMap<String, HashMap<String, HashSet<String>>>,
}

/// Registry of handoff processors.
pub struct ProcessorRegistry {
    inner: RwLock<RegistryInner>,
}

impl ProcessorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Register a processor in the global scope under its own metadata.
    pub async fn register(&self, processor: Arc<dyn HandoffProcessor>) {
        let metadata = processor.metadata();
        self.upsert(GLOBAL_ORGANIZATION_SCOPE, None, metadata, processor)
            .await;
    }

    /// Register a processor for explicit types and policy in a scope.
    ///
    /// Replacing an existing entry with a different instance is allowed and
    /// logged as a conflict; the last registration wins.
    pub async fn upsert(
        &self,
        organization_id: &str,
        plugin_name: Option<&str>,
        metadata: ProcessorMetadata,
        processor: Arc<dyn HandoffProcessor>,
    ) {
        if metadata.types.is_empty() {
            debug!(processor = %processor.name(), "Processor declares no types, skipping");
            return;
        }

        let mut inner = self.inner.write().await;
        let org_map = inner.by_org.entry(organization_id.to_string()).or_default();
        for message_type in &metadata.types {
            if let Some(previous) = org_map.get(message_type)
                && !same_instance(&previous.processor, &processor)
            {
                warn!(
                    message_type = %message_type,
                    organization_id = %organization_id,
                    previous = %previous.processor.name(),
                    next = %processor.name(),
                    "Processor type conflict, overriding"
                );
            }
            org_map.insert(
                message_type.clone(),
                ResolvedProcessor {
                    message_type: message_type.clone(),
                    organization_id: organization_id.to_string(),
                    processor: Arc::clone(&processor),
                    metadata: metadata.clone(),
                },
            );
        }

        if let Some(plugin) = plugin_name {
            inner
                .plugin_types
                .entry(plugin.to_string())
                .or_default()
                .entry(organization_id.to_string())
                .or_default()
                .extend(metadata.types.iter().cloned());
        }
        drop(inner);

        debug!(
            processor = %processor.name(),
            organization_id = %organization_id,
            types = ?metadata.types,
            "Registered processor"
        );
    }

    /// Remove every type a plugin contributed to a scope. Unknown plugins are
    /// a no-op. Returns the removed types.
    pub async fn remove(&self, organization_id: &str, plugin_name: &str) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let Some(plugin_orgs) = inner.plugin_types.get_mut(plugin_name) else {
            return Vec::new();
        };
        let Some(types) = plugin_orgs.remove(organization_id) else {
            return Vec::new();
        };
        if plugin_orgs.is_empty() {
            inner.plugin_types.remove(plugin_name);
        }

        if let Some(org_map) = inner.by_org.get_mut(organization_id) {
            for message_type in &types {
                org_map.remove(message_type);
            }
            if org_map.is_empty() {
                inner.by_org.remove(organization_id);
            }
        }
        drop(inner);

        let mut removed: Vec<String> = types.into_iter().collect();
        removed.sort();
        info!(
            plugin = %plugin_name,
            organization_id = %organization_id,
            types = ?removed,
            "Removed plugin processors"
        );
        removed
    }

    /// Resolve the processor for a type: organization scope first, then the
    /// global scope.
    pub async fn resolve(
        &self,
        message_type: &str,
        organization_id: Option<&str>,
    ) -> Result<ResolvedProcessor, DispatchError> {
        let org_id = effective_org(organization_id);
        let inner = self.inner.read().await;

        inner
            .by_org
            .get(org_id)
            .and_then(|m| m.get(message_type))
            .or_else(|| {
                inner
                    .by_org
                    .get(GLOBAL_ORGANIZATION_SCOPE)
                    .and_then(|m| m.get(message_type))
            })
            .cloned()
            .ok_or_else(|| DispatchError::NoHandler {
                message_type: message_type.to_string(),
                organization_id: org_id.to_string(),
            })
    }

    /// Processors visible to an organization: its own plus global ones, the
    /// organization's entry winning on a type collision.
    pub async fn list(&self, organization_id: Option<&str>) -> Vec<ResolvedProcessor> {
        let org_id = effective_org(organization_id);
        let inner = self.inner.read().await;

        let mut listed: Vec<ResolvedProcessor> = inner
            .by_org
            .get(org_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();

        if org_id != GLOBAL_ORGANIZATION_SCOPE
            && let Some(global) = inner.by_org.get(GLOBAL_ORGANIZATION_SCOPE)
        {
            let scoped: HashSet<&str> = listed.iter().map(|p| p.message_type.as_str()).collect();
            let mut shadowed = Vec::new();
            let mut extra = Vec::new();
            for (message_type, resolved) in global {
                if scoped.contains(message_type.as_str()) {
                    shadowed.push(message_type.clone());
                } else {
                    extra.push(resolved.clone());
                }
            }
            if !shadowed.is_empty() {
                debug!(
                    organization_id = %org_id,
                    types = ?shadowed,
                    "Organization processors shadow global ones"
                );
            }
            listed.extend(extra);
        }

        listed.sort_by(|a, b| a.message_type.cmp(&b.message_type));
        listed
    }

    /// Every registered type in a scope.
    pub async fn types(&self, organization_id: Option<&str>) -> Vec<String> {
        self.list(organization_id)
            .await
            .into_iter()
            .map(|p| p.message_type)
            .collect()
    }

    /// Apply one plugin event.
    pub async fn apply(&self, event: PluginEvent) {
        if event
            .strategy()
            .is_some_and(|s| s != HANDOFF_PROCESSOR_STRATEGY)
        {
            return;
        }
        match event {
            PluginEvent::Upsert {
                organization_id,
                plugin_name,
                processor,
                ..
            } => {
                let metadata = processor.metadata();
                self.upsert(&organization_id, Some(&plugin_name), metadata, processor)
                    .await;
            }
            PluginEvent::Remove {
                organization_id,
                plugin_name,
                ..
            } => {
                self.remove(&organization_id, &plugin_name).await;
            }
        }
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn effective_org(organization_id: Option<&str>) -> &str {
    organization_id
        .filter(|id| !id.is_empty())
        .unwrap_or(GLOBAL_ORGANIZATION_SCOPE)
}

fn same_instance(a: &Arc<dyn HandoffProcessor>, b: &Arc<dyn HandoffProcessor>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Spawn a task applying plugin events to the registry until the sender
/// side closes.
pub fn spawn_plugin_listener(
    registry: Arc<ProcessorRegistry>,
    mut events: broadcast::Receiver<PluginEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => registry.apply(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Plugin event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Plugin event stream closed");
    })
}
