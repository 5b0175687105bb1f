//! Unit tests for NVMeshSpec defaults, validation and serialization

#[cfg(test)]
mod nvmesh_spec {
    use crate::crd::{ClusterAction, NVMesh, NVMeshSpec, NVMeshStatus, TaskState};
    use kube::CustomResourceExt;

    #[test]
    fn test_apply_defaults_fills_empty_fields() {
        let mut spec = NVMeshSpec::default();
        spec.apply_defaults("2.5.1-12");

        assert_eq!(spec.core.image_registry, "registry.excelero.com");
        assert_eq!(spec.core.image_version_tag, "2.5.1-12");
        assert_eq!(spec.management.image_registry, "registry.excelero.com");
        assert_eq!(spec.csi.controller_replicas, 1);
        assert_eq!(spec.management.replicas, 1);
    }

    #[test]
    fn test_apply_defaults_keeps_user_values() {
        let mut spec = NVMeshSpec::default();
        spec.core.image_registry = "my.registry".to_string();
        spec.core.image_version_tag = "dev".to_string();
        spec.management.replicas = 3;
        spec.apply_defaults("2.5.1-12");

        assert_eq!(spec.core.image_registry, "my.registry");
        assert_eq!(spec.core.image_version_tag, "dev");
        assert_eq!(spec.management.replicas, 3);
    }

    #[test]
    fn test_external_mongo_requires_address() {
        let mut spec = NVMeshSpec::default();
        spec.management.mongo_db.external = true;

        let err = spec.validate().unwrap_err();
        assert_eq!(err.field, "spec.management.mongoDB.address");

        spec.management.mongo_db.address = "mongo.example:27017".to_string();
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_external_and_operator_mongo_are_exclusive() {
        let mut spec = NVMeshSpec::default();
        spec.management.mongo_db.external = true;
        spec.management.mongo_db.address = "mongo.example:27017".to_string();
        spec.management.mongo_db.use_operator = true;

        let err = spec.validate().unwrap_err();
        assert_eq!(err.field, "spec.management.mongoDB.useOperator");
    }

    #[test]
    fn test_upload_to_s3_requires_bucket() {
        let mut action = ClusterAction::new("collect-logs");
        action
            .args
            .insert("upload-to-s3".to_string(), " ".to_string());
        let spec = NVMeshSpec {
            actions: vec![action],
            ..Default::default()
        };

        let err = spec.validate().unwrap_err();
        assert_eq!(err.field, "spec.actions[0].args.upload-to-s3");
    }

    #[test]
    fn test_web_ui_url() {
        let mut spec = NVMeshSpec::default();
        assert_eq!(spec.web_ui_url(), "");

        spec.management.external_ips = vec!["10.0.0.5".to_string(), "10.0.0.6".to_string()];
        assert_eq!(spec.web_ui_url(), "https://10.0.0.5:4000");

        spec.management.no_ssl = true;
        assert_eq!(spec.web_ui_url(), "http://10.0.0.5:4000");
    }

    #[test]
    fn test_spec_deserializes_camel_case_fields() {
        let spec: NVMeshSpec = serde_json::from_value(serde_json::json!({
            "core": {"version": "2.5", "configuredNICs": "ib0", "tcpOnly": true},
            "management": {
                "version": "2.5",
                "externalIPs": ["1.2.3.4"],
                "noSSL": true,
                "mongoDB": {"external": true, "address": "db:27017"}
            },
            "operator": {"ignoreVolumeAttachmentOnDelete": true},
            "actions": [{"name": "collect-logs", "args": {"upload-to-s3": "bucket"}}]
        }))
        .unwrap();

        assert_eq!(spec.core.configured_nics, "ib0");
        assert!(spec.core.tcp_only);
        assert_eq!(spec.management.external_ips, vec!["1.2.3.4"]);
        assert!(spec.management.no_ssl);
        assert_eq!(spec.management.mongo_db.address, "db:27017");
        assert!(spec.operator.ignore_volume_attachment_on_delete);
        assert_eq!(spec.actions[0].arg("upload-to-s3"), Some("bucket"));
    }

    #[test]
    fn test_ledger_uses_task_state_strings() {
        let mut status = NVMeshStatus::default();
        status
            .actions_status
            .entry("collect-logs".to_string())
            .or_default()
            .insert("CollectDB".to_string(), TaskState::TaskFinished);

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(
            value["actionsStatus"]["collect-logs"]["CollectDB"],
            "TaskFinished"
        );
    }

    #[test]
    fn test_crd_metadata() {
        let crd = NVMesh::crd();
        assert_eq!(crd.spec.group, "nvmesh.excelero.com");
        assert_eq!(crd.spec.names.kind, "NVMesh");
        assert_eq!(crd.spec.names.plural, "nvmeshes");
    }
}
