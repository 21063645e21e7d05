//! Tests for the SnapShot CRD types

use kube::CustomResourceExt;

use super::*;

fn sample_manifest() -> &'static str {
    r#"
apiVersion: stove8s.bud.studio/v1beta1
kind: SnapShot
metadata:
  name: demo
  namespace: team-a
spec:
  selector:
    object:
      kind: Pod
      name: web-0
    container: app
  input:
    delaySeconds: 0
    policy: IfNotPresent
  output:
    containerRegistry:
      imageReference: reg.example.com/demo/app:snap-1
      imagePushSecret:
        name: push-creds
"#
}

#[test]
fn snapshot_manifest_deserializes() {
    let snapshot: SnapShot = serde_yaml::from_str(sample_manifest()).unwrap();

    assert_eq!(snapshot.spec.selector.object.kind, "Pod");
    assert_eq!(snapshot.spec.selector.object.name, "web-0");
    assert_eq!(snapshot.spec.selector.object.namespace, None);
    assert_eq!(snapshot.spec.selector.container, "app");
    assert_eq!(snapshot.spec.input.policy, SnapShotInputPolicy::IfNotPresent);
    assert_eq!(
        snapshot.output_reference(),
        "reg.example.com/demo/app:snap-1"
    );
    assert_eq!(
        snapshot.spec.output.container_registry.image_push_secret.name,
        "push-creds"
    );
    assert!(snapshot.status.is_none());
}

#[test]
fn input_defaults_when_omitted() {
    let manifest = r#"
apiVersion: stove8s.bud.studio/v1beta1
kind: SnapShot
metadata:
  name: demo
spec:
  selector:
    object:
      kind: Pod
      name: web-0
    container: app
  output:
    containerRegistry:
      imageReference: reg.example.com/demo/app:snap-1
"#;
    let snapshot: SnapShot = serde_yaml::from_str(manifest).unwrap();
    assert_eq!(snapshot.spec.input.delay_seconds, 0);
    assert_eq!(snapshot.spec.input.policy, SnapShotInputPolicy::IfNotPresent);
}

#[test]
fn status_defaults() {
    let status = SnapShotStatus::default();
    assert_eq!(status.stage, None);
    assert_eq!(status.state, SnapShotState::Idle);
    assert_eq!(status.node, None);
    assert!(status.checkpoint_node_path.is_empty());
    assert!(status.job_id.is_empty());
    assert!(!status.output_reference_is_valid);
}

#[test]
fn stage_and_state_serialize_as_pascal_case_strings() {
    assert_eq!(
        serde_json::to_string(&SnapShotStage::CriuDumping).unwrap(),
        "\"CriuDumping\""
    );
    assert_eq!(
        serde_json::to_string(&SnapShotStage::Formatting).unwrap(),
        "\"Formatting\""
    );
    assert_eq!(
        serde_json::to_string(&SnapShotStage::Pushing).unwrap(),
        "\"Pushing\""
    );
    assert_eq!(
        serde_json::to_string(&SnapShotState::Success).unwrap(),
        "\"Success\""
    );
    assert_eq!(
        serde_json::to_string(&SnapShotState::Idle).unwrap(),
        "\"Idle\""
    );
}

/// Merge patches of the whole status must overwrite every field, so the
/// serialized form may not skip empty values.
#[test]
fn status_serializes_every_field() {
    let value = serde_json::to_value(SnapShotStatus::default()).unwrap();
    let object = value.as_object().unwrap();
    for key in [
        "stage",
        "state",
        "node",
        "checkpointNodePath",
        "jobId",
        "outputReferenceIsValid",
    ] {
        assert!(object.contains_key(key), "status is missing {key}");
    }
}

#[test]
fn status_round_trips() {
    let status = SnapShotStatus {
        stage: Some(SnapShotStage::Pushing),
        state: SnapShotState::Started,
        node: Some(SnapShotNode {
            name: "n1".to_string(),
            addr: "10.0.0.2".to_string(),
            daemonset_port: 31008,
            kubelet_port: 10250,
        }),
        checkpoint_node_path: "/var/lib/kubelet/checkpoints/checkpoint-web-0_team-a-app-1.tar"
            .to_string(),
        job_id: "0190163d-8694-7f9c-a2e5-0a3f4c1f9a42".to_string(),
        output_reference_is_valid: false,
    };

    let json = serde_json::to_string(&status).unwrap();
    let back: SnapShotStatus = serde_json::from_str(&json).unwrap();
    assert_eq!(back, status);
}

#[test]
fn crd_metadata() {
    let crd = SnapShot::crd();
    assert_eq!(crd.metadata.name.as_deref(), Some("snapshots.stove8s.bud.studio"));
    assert_eq!(crd.spec.names.kind, "SnapShot");
    assert_eq!(
        crd.spec.names.short_names.as_deref(),
        Some(&["snap".to_string()][..])
    );

    let version = &crd.spec.versions[0];
    assert_eq!(version.name, "v1beta1");
    let subresources = version.subresources.as_ref().expect("status subresource");
    assert!(subresources.status.is_some());
}
