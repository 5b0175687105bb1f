//! Tests of the object reconciler against the in-memory store

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
    use k8s_openapi::api::core::v1::{ConfigMap, Container, PodSpec, PodTemplateSpec};
    use kube::api::{DynamicObject, ObjectMeta};
    use kube::ResourceExt;

    use crate::controller::components::csi::CSI_CONTROLLER;
    use crate::controller::components::CsiDriver;
    use crate::controller::resources::{
        ensure_exists, ensure_removed, reconcile_manifests, Applied, NoHooks, CLUSTER_NAME_LABEL,
        MANAGED_BY_LABEL,
    };
    use crate::controller::store::to_dynamic;
    use crate::controller::test_support::{test_cluster, FakeDatabase, FakeStore, TestHarness};
    use crate::crd::NVMesh;
    use crate::error::Error;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn harness() -> TestHarness {
        TestHarness::new(FakeStore::default(), FakeDatabase::initialized())
    }

    fn config_map(name: &str) -> DynamicObject {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("key".to_string(), "value".to_string())])),
            ..Default::default()
        };
        to_dynamic(&cm).unwrap()
    }

    fn csi_controller() -> DynamicObject {
        let ss = StatefulSet {
            metadata: ObjectMeta {
                name: Some(CSI_CONTROLLER.to_string()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "nvmesh-csi-driver".to_string(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        to_dynamic(&ss).unwrap()
    }

    fn cluster_with_csi(version: &str) -> NVMesh {
        let mut cluster = test_cluster("cluster");
        cluster.spec.csi.version = version.to_string();
        cluster.spec.csi.controller_replicas = 1;
        cluster
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_ensure_exists_is_idempotent() {
        let harness = harness();
        let cluster = test_cluster("cluster");

        let first = ensure_exists(&harness.state, &cluster, config_map("settings"), &NoHooks)
            .await
            .unwrap();
        let second = ensure_exists(&harness.state, &cluster, config_map("settings"), &NoHooks)
            .await
            .unwrap();

        assert_eq!(first, Applied::Created);
        assert_eq!(second, Applied::Unchanged);
        assert_eq!(FakeStore::count(&harness.store.creates), 1);
        assert_eq!(FakeStore::count(&harness.store.updates), 0);
    }

    #[tokio::test]
    async fn test_created_object_is_owned_and_labelled() {
        let harness = harness();
        let cluster = test_cluster("cluster");

        ensure_exists(&harness.state, &cluster, config_map("settings"), &NoHooks)
            .await
            .unwrap();

        let stored = harness
            .store
            .object("ConfigMap", Some("nvmesh"), "settings")
            .unwrap();
        assert_eq!(stored.labels()[CLUSTER_NAME_LABEL], "cluster");
        assert_eq!(stored.labels()[MANAGED_BY_LABEL], "nvmesh-operator");
        let owner = &stored.owner_references()[0];
        assert_eq!(owner.kind, "NVMesh");
        assert_eq!(owner.uid, "uid-cluster");
    }

    #[tokio::test]
    async fn test_image_drift_triggers_single_update() {
        let harness = harness();

        ensure_exists(&harness.state, &cluster_with_csi("v1.1.2"), csi_controller(), &CsiDriver)
            .await
            .unwrap();
        let unchanged =
            ensure_exists(&harness.state, &cluster_with_csi("v1.1.2"), csi_controller(), &CsiDriver)
                .await
                .unwrap();
        assert_eq!(unchanged, Applied::Unchanged);
        assert_eq!(FakeStore::count(&harness.store.updates), 0);

        let upgraded =
            ensure_exists(&harness.state, &cluster_with_csi("v1.2.0"), csi_controller(), &CsiDriver)
                .await
                .unwrap();
        assert_eq!(upgraded, Applied::Updated);
        assert_eq!(FakeStore::count(&harness.store.updates), 1);

        let stored = harness
            .store
            .object("StatefulSet", Some("nvmesh"), CSI_CONTROLLER)
            .unwrap();
        assert_eq!(
            stored.data["spec"]["template"]["spec"]["containers"][0]["image"],
            "excelero/nvmesh-csi-driver:v1.2.0"
        );
    }

    #[tokio::test]
    async fn test_ensure_removed_tolerates_absent_object() {
        let harness = harness();
        let cluster = test_cluster("cluster");

        let absent = ensure_removed(&harness.state, &cluster, &config_map("settings"))
            .await
            .unwrap();
        assert_eq!(absent, Applied::Absent);

        ensure_exists(&harness.state, &cluster, config_map("settings"), &NoHooks)
            .await
            .unwrap();
        let removed = ensure_removed(&harness.state, &cluster, &config_map("settings"))
            .await
            .unwrap();
        assert_eq!(removed, Applied::Removed);
        assert_eq!(FakeStore::count(&harness.store.deletes), 1);
    }

    #[tokio::test]
    async fn test_partial_manifest_still_reconciles_valid_documents() {
        let harness = harness();
        let cluster = test_cluster("cluster");
        harness.add_manifest(
            "core",
            "config.yaml",
            r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: first
---
apiVersion: v1
kind: ConfigMap
metadata: {}
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: third
"#,
        );

        let err = reconcile_manifests(&harness.state, &cluster, &NoHooks, "core", true, false)
            .await
            .unwrap_err();

        match err {
            Error::ManifestParse(parse) => {
                assert_eq!(parse.documents.len(), 1);
                assert_eq!(parse.documents[0].index, 1);
            }
            other => panic!("expected a parse error, got {other:?}"),
        }
        assert_eq!(harness.store.names_of("ConfigMap"), vec!["first", "third"]);
    }

    #[tokio::test]
    async fn test_missing_asset_directory_is_empty() {
        let harness = harness();
        let cluster = test_cluster("cluster");

        let applied = reconcile_manifests(&harness.state, &cluster, &NoHooks, "csi", true, false)
            .await
            .unwrap();
        assert!(applied.is_empty());
    }

    #[tokio::test]
    async fn test_platform_kind_skipped_off_openshift() {
        let harness = harness();
        let cluster = test_cluster("cluster");
        let scc: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "security.openshift.io/v1",
            "kind": "SecurityContextConstraints",
            "metadata": { "name": "nvmesh-privileged" },
            "allowPrivilegedContainer": true
        }))
        .unwrap();

        let applied = ensure_exists(&harness.state, &cluster, scc, &NoHooks)
            .await
            .unwrap();

        assert_eq!(applied, Applied::Unsupported);
        assert_eq!(FakeStore::count(&harness.store.creates), 0);
    }
}
