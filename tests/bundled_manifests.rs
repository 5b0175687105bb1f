//! Checks the manifest tree shipped with the operator image.
//!
//! Run with: cargo test --test bundled_manifests

use std::collections::BTreeSet;
use std::path::PathBuf;

use kube::api::DynamicObject;
use kube::ResourceExt;
use nvmesh_operator::controller::components::csi::{CSI_CONTROLLER, CSI_NODE_DRIVER};
use nvmesh_operator::controller::components::management::{
    MANAGEMENT_CONFIG_MAP, MANAGEMENT_GUI_SERVICE, MANAGEMENT_STATEFUL_SET, MONGO_STATEFUL_SET,
};
use nvmesh_operator::controller::components::nvmesh_core::CORE_CONFIG_MAP;
use nvmesh_operator::controller::finalizers::CSI_DRIVER_NAME;
use nvmesh_operator::controller::manifests::{list_manifest_files, load_file};
use nvmesh_operator::controller::uninstall::{COMPONENT_LABEL, WORKLOAD_COMPONENTS};

fn resources_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("resources")
}

fn load_dir(dir: &str, recursive: bool) -> Vec<DynamicObject> {
    let root = resources_dir().join(dir);
    let mut objects = Vec::new();
    for file in list_manifest_files(&root, recursive).unwrap() {
        let parsed = load_file(&file).unwrap();
        assert!(parsed.error.is_none(), "{:?}", parsed.error);
        objects.extend(parsed.objects);
    }
    objects
}

fn kind(obj: &DynamicObject) -> &str {
    obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default()
}

fn names(objects: &[DynamicObject], wanted: &str) -> BTreeSet<String> {
    objects
        .iter()
        .filter(|o| kind(o) == wanted)
        .map(|o| o.name_any())
        .collect()
}

#[test]
fn every_asset_directory_parses() {
    for (dir, recursive) in [
        ("core", true),
        ("management", true),
        ("mongodb", false),
        ("mongodb-operator", false),
        ("mongodb-operator/custom-resource", false),
        ("csi", true),
    ] {
        assert!(!load_dir(dir, recursive).is_empty(), "{dir} is empty");
    }
}

#[test]
fn component_objects_match_driver_hooks() {
    let core = load_dir("core", true);
    assert_eq!(
        names(&core, "DaemonSet"),
        BTreeSet::from([
            "nvmesh-client".to_string(),
            "nvmesh-mcs-agent".to_string(),
            "nvmesh-target".to_string(),
        ])
    );
    assert!(names(&core, "ConfigMap").contains(CORE_CONFIG_MAP));

    let management = load_dir("management", true);
    assert!(names(&management, "StatefulSet").contains(MANAGEMENT_STATEFUL_SET));
    assert!(names(&management, "ConfigMap").contains(MANAGEMENT_CONFIG_MAP));
    assert!(names(&management, "Service").contains(MANAGEMENT_GUI_SERVICE));

    let mongo = load_dir("mongodb", false);
    assert!(names(&mongo, "StatefulSet").contains(MONGO_STATEFUL_SET));

    let csi = load_dir("csi", true);
    assert!(names(&csi, "StatefulSet").contains(CSI_CONTROLLER));
    assert!(names(&csi, "DaemonSet").contains(CSI_NODE_DRIVER));
    assert!(names(&csi, "CSIDriver").contains(CSI_DRIVER_NAME));
}

#[test]
fn workload_pods_carry_component_label() {
    let mut labelled = BTreeSet::new();
    for dir in ["core", "csi"] {
        for obj in load_dir(dir, true) {
            if kind(&obj) != "DaemonSet" {
                continue;
            }
            let label = obj
                .data
                .pointer("/spec/template/metadata/labels")
                .and_then(|labels| labels.get(COMPONENT_LABEL))
                .and_then(|value| value.as_str())
                .map(str::to_string);
            labelled.extend(label);
        }
    }

    let expected: BTreeSet<String> = WORKLOAD_COMPONENTS.iter().map(|c| c.to_string()).collect();
    assert_eq!(labelled, expected);
}
