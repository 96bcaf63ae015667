use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder};

pub const REASON_OBSOLETE_HOST_MODEL: &str = "HostModelIsObsolete";

/// Reference to the Node the controller labels. Nodes are cluster scoped.
pub fn node_obj_ref(name: &str, uid: Option<&str>) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".into()),
        kind: Some("Node".into()),
        name: Some(name.into()),
        uid: uid.map(|u| u.into()),
        ..Default::default()
    }
}

/// Publish a warning event against the node. Event recording is
/// informational; failures are ignored.
pub async fn emit_warning(
    recorder: &Recorder,
    name: &str,
    uid: Option<&str>,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    let _ = recorder
        .publish(
            &Event {
                type_: EventType::Warning,
                reason: reason.into(),
                note,
                action: action.into(),
                secondary: None,
            },
            &node_obj_ref(name, uid),
        )
        .await;
}
