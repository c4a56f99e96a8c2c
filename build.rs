use tonic_build::manual::{Builder, Method, Service};

const PROTO_PATH: &str = "crate::csi::proto";

fn method(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("{}::{}", PROTO_PATH, input))
        .output_type(format!("{}::{}", PROTO_PATH, output))
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn service(name: &str, methods: Vec<Method>) -> Service {
    methods
        .into_iter()
        .fold(Service::builder().name(name).package("csi.v1"), |builder, m| {
            builder.method(m)
        })
        .build()
}

fn main() {
    // Service stubs over the hand-written csi.v1 messages, so no protoc is needed
    let identity = service(
        "Identity",
        vec![
            method("get_plugin_info", "GetPluginInfo", "GetPluginInfoRequest", "GetPluginInfoResponse"),
            method(
                "get_plugin_capabilities",
                "GetPluginCapabilities",
                "GetPluginCapabilitiesRequest",
                "GetPluginCapabilitiesResponse",
            ),
            method("probe", "Probe", "ProbeRequest", "ProbeResponse"),
        ],
    );

    let controller = service(
        "Controller",
        vec![
            method("create_volume", "CreateVolume", "CreateVolumeRequest", "CreateVolumeResponse"),
            method("delete_volume", "DeleteVolume", "DeleteVolumeRequest", "DeleteVolumeResponse"),
            method(
                "controller_publish_volume",
                "ControllerPublishVolume",
                "ControllerPublishVolumeRequest",
                "ControllerPublishVolumeResponse",
            ),
            method(
                "controller_unpublish_volume",
                "ControllerUnpublishVolume",
                "ControllerUnpublishVolumeRequest",
                "ControllerUnpublishVolumeResponse",
            ),
            method(
                "validate_volume_capabilities",
                "ValidateVolumeCapabilities",
                "ValidateVolumeCapabilitiesRequest",
                "ValidateVolumeCapabilitiesResponse",
            ),
            method("list_volumes", "ListVolumes", "ListVolumesRequest", "ListVolumesResponse"),
            method("get_capacity", "GetCapacity", "GetCapacityRequest", "GetCapacityResponse"),
            method(
                "controller_get_capabilities",
                "ControllerGetCapabilities",
                "ControllerGetCapabilitiesRequest",
                "ControllerGetCapabilitiesResponse",
            ),
            method(
                "controller_modify_volume",
                "ControllerModifyVolume",
                "ControllerModifyVolumeRequest",
                "ControllerModifyVolumeResponse",
            ),
        ],
    );

    let node = service(
        "Node",
        vec![
            method("node_stage_volume", "NodeStageVolume", "NodeStageVolumeRequest", "NodeStageVolumeResponse"),
            method(
                "node_unstage_volume",
                "NodeUnstageVolume",
                "NodeUnstageVolumeRequest",
                "NodeUnstageVolumeResponse",
            ),
            method(
                "node_publish_volume",
                "NodePublishVolume",
                "NodePublishVolumeRequest",
                "NodePublishVolumeResponse",
            ),
            method(
                "node_unpublish_volume",
                "NodeUnpublishVolume",
                "NodeUnpublishVolumeRequest",
                "NodeUnpublishVolumeResponse",
            ),
            method(
                "node_get_volume_stats",
                "NodeGetVolumeStats",
                "NodeGetVolumeStatsRequest",
                "NodeGetVolumeStatsResponse",
            ),
            method(
                "node_expand_volume",
                "NodeExpandVolume",
                "NodeExpandVolumeRequest",
                "NodeExpandVolumeResponse",
            ),
            method(
                "node_get_capabilities",
                "NodeGetCapabilities",
                "NodeGetCapabilitiesRequest",
                "NodeGetCapabilitiesResponse",
            ),
            method("node_get_info", "NodeGetInfo", "NodeGetInfoRequest", "NodeGetInfoResponse"),
        ],
    );

    Builder::new().compile(&[identity, controller, node]);
}
