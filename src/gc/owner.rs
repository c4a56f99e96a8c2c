//! Owner-node rule
//!
//! A PersistentVolume belongs to the node named by its selected-node
//! annotation, or failing that by the initial node recorded in its CSI
//! volume attributes.

use crate::volume::{DRIVER_NAME, SELECTED_INITIAL_NODE_PARAM, SELECTED_NODE_ANNOTATION};
use k8s_openapi::api::core::v1::PersistentVolume;

/// Node owning `pv`, if any is recorded
pub fn owner_node(pv: &PersistentVolume) -> Option<&str> {
    if let Some(node) = pv
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SELECTED_NODE_ANNOTATION))
    {
        return Some(node.as_str());
    }
    pv.spec
        .as_ref()?
        .csi
        .as_ref()?
        .volume_attributes
        .as_ref()?
        .get(SELECTED_INITIAL_NODE_PARAM)
        .map(String::as_str)
}

/// Whether `pv` is owned by a node other than `node_id`.
///
/// A volume without a recorded owner is never mismatched.
pub fn has_owner_mismatch(pv: &PersistentVolume, node_id: &str) -> bool {
    owner_node(pv).is_some_and(|owner| !owner.eq_ignore_ascii_case(node_id))
}

/// Whether `pv` was provisioned by this driver
pub fn is_driver_volume(pv: &PersistentVolume) -> bool {
    volume_handle(pv).is_some()
}

/// Volume handle of a PersistentVolume provisioned by this driver
pub fn volume_handle(pv: &PersistentVolume) -> Option<&str> {
    pv.spec
        .as_ref()?
        .csi
        .as_ref()
        .filter(|csi| csi.driver == DRIVER_NAME)
        .map(|csi| csi.volume_handle.as_str())
}
