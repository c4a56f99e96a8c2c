//! Co-location admission
//!
//! Steers new pods toward the nodes holding their local volumes by adding a
//! node-affinity term on the hostname label. Availability volumes get a
//! preferred term; durability volumes a required one.

use super::retry::retry_on_error;
use crate::domain::ports::ClusterApiRef;
use crate::error::Result;
use crate::gc::owner_node;
use crate::volume::{DRIVER_NAME, FAILOVER_MODE_PARAM, HOSTNAME_LABEL};
use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, Pod,
    PreferredSchedulingTerm, Volume,
};
use std::fmt;
use tracing::{debug, info, warn};

const PREFERRED_WEIGHT: i32 = 100;

// =============================================================================
// Failover Mode
// =============================================================================

/// How strictly a pod is bound to the node holding its volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailoverMode {
    /// Prefer the volume's node, schedule elsewhere when it is unavailable
    #[default]
    Availability,
    /// Only ever schedule on the volume's node
    Durability,
}

impl FailoverMode {
    /// Parse a volume attribute; absent or unknown values mean availability
    pub fn from_attribute(value: Option<&str>) -> Self {
        match value {
            Some("durability") => FailoverMode::Durability,
            Some("availability") | None => FailoverMode::Availability,
            Some(other) => {
                debug!("Invalid failover mode {:?}, using availability", other);
                FailoverMode::Availability
            }
        }
    }
}

impl fmt::Display for FailoverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailoverMode::Availability => write!(f, "availability"),
            FailoverMode::Durability => write!(f, "durability"),
        }
    }
}

// =============================================================================
// Mutation
// =============================================================================

/// Outcome of admitting a pod
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Admit unchanged, with the reason
    Allow(String),
    /// Admit with this patch applied
    Patch(json_patch::Patch),
}

/// Name of the claim backing `volume`, if it is a claim at all.
///
/// Generic ephemeral volumes get a claim named `<pod>-<volume>`.
fn claim_name(pod: &Pod, volume: &Volume) -> Option<(String, bool)> {
    if let Some(pvc) = &volume.persistent_volume_claim {
        return Some((pvc.claim_name.clone(), false));
    }
    volume.ephemeral.as_ref()?;
    let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
    Some((format!("{}-{}", pod_name, volume.name), true))
}

/// Add a hostname affinity term for `nodes` to a copy of `pod`
pub fn inject_node_affinity(pod: &Pod, nodes: Vec<String>, mode: FailoverMode) -> Pod {
    let mut mutated = pod.clone();
    let term = NodeSelectorTerm {
        match_expressions: Some(vec![NodeSelectorRequirement {
            key: HOSTNAME_LABEL.to_string(),
            operator: "In".to_string(),
            values: Some(nodes),
        }]),
        match_fields: None,
    };

    let spec = mutated.spec.get_or_insert_with(Default::default);
    let affinity = spec.affinity.get_or_insert_with(Affinity::default);
    let node_affinity = affinity.node_affinity.get_or_insert_with(NodeAffinity::default);

    match mode {
        FailoverMode::Durability => {
            node_affinity
                .required_during_scheduling_ignored_during_execution
                .get_or_insert_with(|| NodeSelector {
                    node_selector_terms: Vec::new(),
                })
                .node_selector_terms
                .push(term);
        }
        FailoverMode::Availability => {
            node_affinity
                .preferred_during_scheduling_ignored_during_execution
                .get_or_insert_with(Vec::new)
                .push(PreferredSchedulingTerm {
                    preference: term,
                    weight: PREFERRED_WEIGHT,
                });
        }
    }
    mutated
}

/// JSON patch turning `original` into `mutated`
pub fn pod_patch(original: &Pod, mutated: &Pod) -> Result<json_patch::Patch> {
    let before = serde_json::to_value(original)?;
    let after = serde_json::to_value(mutated)?;
    Ok(json_patch::diff(&before, &after))
}

// =============================================================================
// Handler
// =============================================================================

pub struct HyperconvergedHandler {
    cluster: ClusterApiRef,
}

impl HyperconvergedHandler {
    pub fn new(cluster: ClusterApiRef) -> Self {
        Self { cluster }
    }

    /// Decide how `pod`, being created in `namespace`, is admitted
    pub async fn mutate(&self, namespace: &str, pod: &Pod) -> Result<Mutation> {
        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
        let volumes = pod
            .spec
            .as_ref()
            .and_then(|s| s.volumes.as_deref())
            .unwrap_or_default();
        if volumes.is_empty() {
            debug!("Allowing pod {}/{} with no volumes", namespace, pod_name);
            return Ok(Mutation::Allow("pod has no volumes".into()));
        }

        let mut pv_names = Vec::new();
        for volume in volumes {
            let Some((claim, ephemeral)) = claim_name(pod, volume) else {
                continue;
            };
            let pvc = retry_on_error(|| self.cluster.get_persistent_volume_claim(namespace, &claim)).await?;
            let Some(pvc) = pvc else {
                info!("Allowing pod {}/{}: claim {} not found", namespace, pod_name, claim);
                return Ok(Mutation::Allow("pvc not found".into()));
            };

            let class_name = if ephemeral {
                volume
                    .ephemeral
                    .as_ref()
                    .and_then(|e| e.volume_claim_template.as_ref())
                    .and_then(|t| t.spec.storage_class_name.clone())
            } else {
                pvc.spec.as_ref().and_then(|s| s.storage_class_name.clone())
            };
            let Some(class_name) = class_name else {
                continue;
            };
            let Some(class) = retry_on_error(|| self.cluster.get_storage_class(&class_name)).await? else {
                continue;
            };
            if class.provisioner != DRIVER_NAME {
                continue;
            }
            if let Some(pv_name) = pvc.spec.and_then(|s| s.volume_name) {
                pv_names.push(pv_name);
            }
        }

        if pv_names.is_empty() {
            debug!("Allowing pod {}/{} with no local volumes", namespace, pod_name);
            return Ok(Mutation::Allow("pod has no hyperconverged volumes".into()));
        }

        let mut nodes = Vec::new();
        let mut mode = FailoverMode::Availability;
        for pv_name in &pv_names {
            let Some(pv) = retry_on_error(|| self.cluster.get_persistent_volume(pv_name)).await? else {
                continue;
            };
            let attributes = pv
                .spec
                .as_ref()
                .and_then(|s| s.csi.as_ref())
                .filter(|csi| !csi.volume_handle.is_empty())
                .map(|csi| csi.volume_attributes.clone().unwrap_or_default());
            let Some(attributes) = attributes else {
                continue;
            };
            if FailoverMode::from_attribute(attributes.get(FAILOVER_MODE_PARAM).map(String::as_str))
                == FailoverMode::Durability
            {
                mode = FailoverMode::Durability;
            }
            match owner_node(&pv) {
                Some(node) => nodes.push(node.to_string()),
                None => {
                    warn!("PersistentVolume {} is not assigned to a node", pv_name);
                    return Ok(Mutation::Allow("pv is not assigned to a node".into()));
                }
            }
        }

        if nodes.is_empty() {
            return Ok(Mutation::Allow("no nodes found for volume".into()));
        }

        info!(
            "Adding {} node affinity on {:?} to pod {}/{}",
            mode, nodes, namespace, pod_name
        );
        let mutated = inject_node_affinity(pod, nodes, mode);
        pod_patch(pod, &mutated).map(Mutation::Patch)
    }
}
