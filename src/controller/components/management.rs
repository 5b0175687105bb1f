//! NVMesh management servers and the MongoDB they persist to
//!
//! MongoDB is deployed in one of three ways: from plain manifests, through the
//! MongoDB community operator (operator manifests plus a `MongoDB` custom
//! resource), or not at all when the user points at an external cluster.
//! Management assets are only created once the database answers and holds
//! the `globalSettings` document; the first time around an init job seeds it.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, PodSpec, Service};
use kube::api::DynamicObject;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use super::{add_keep_running_env, override_claim_spec, Component};
use crate::controller::database::{DatabaseError, HiddenSettings};
use crate::controller::jobs::{self, core_image, job_container, new_job};
use crate::controller::manifests;
use crate::controller::options::OperatorOptions;
use crate::controller::outcome::Outcome;
use crate::controller::reconciler::ControllerState;
use crate::controller::resources::{
    self, reconcile_manifests, Applied, ObjectHook, ObjectHooks, UpdatePolicy,
};
use crate::controller::store::{gvk_of, object_gvk, with_typed};
use crate::crd::NVMesh;
use crate::error::{Error, Result};

pub const MANAGEMENT_ASSETS: &str = "management";
pub const MONGODB_ASSETS: &str = "mongodb";
pub const MONGODB_OPERATOR_ASSETS: &str = "mongodb-operator";
pub const MONGODB_CUSTOM_RESOURCE_ASSETS: &str = "mongodb-operator/custom-resource";

pub const MANAGEMENT_STATEFUL_SET: &str = "nvmesh-management";
pub const MANAGEMENT_CONFIG_MAP: &str = "nvmesh-mgmt-config";
pub const MANAGEMENT_GUI_SERVICE: &str = "nvmesh-management-gui";
pub const MONGO_STATEFUL_SET: &str = "mongo";
pub const MONGO_INSTANCE_IMAGE: &str = "nvmesh-mongo-instance";
pub const INIT_DB_JOB: &str = "mgmt-init-db";

pub const RESTARTED_AT_ANNOTATION: &str = "operator.nvmesh.excelero.com/restartedAt";

const MANAGEMENT_IMAGE: &str = "nvmesh-management";
const DEVELOPMENT_MONGO_URI: &str = "mongodb://localhost:27017";

const INIT_DB_REQUEUE: Duration = Duration::from_secs(3);
const DB_UNREACHABLE_REQUEUE: Duration = Duration::from_secs(5);
const RESTART_ATTEMPTS: usize = 5;

static HOOKS: &[ObjectHook] = &[
    ObjectHook {
        kind: "StatefulSet",
        name: MANAGEMENT_STATEFUL_SET,
        init: Some(init_management_stateful_set),
        update: UpdatePolicy::Fields(&["/spec/template/spec/containers/0/image", "/spec/replicas"]),
    },
    ObjectHook {
        kind: "StatefulSet",
        name: MONGO_STATEFUL_SET,
        init: Some(init_mongo_stateful_set),
        update: UpdatePolicy::Fields(&["/spec/template/spec/containers/0/image"]),
    },
    ObjectHook {
        kind: "ConfigMap",
        name: MANAGEMENT_CONFIG_MAP,
        init: Some(init_config_map),
        update: UpdatePolicy::Fields(&["/data/config", "/data/configVersion"]),
    },
    ObjectHook {
        kind: "Service",
        name: MANAGEMENT_GUI_SERVICE,
        init: Some(init_gui_service),
        update: UpdatePolicy::Custom(gui_service_drifted),
    },
    ObjectHook {
        kind: "MongoDB",
        name: "*",
        init: Some(init_mongo_custom_resource),
        update: UpdatePolicy::Fields(&["/spec/replicas"]),
    },
];

pub struct ManagementDriver;

impl ObjectHooks for ManagementDriver {
    fn hooks(&self) -> &'static [ObjectHook] {
        HOOKS
    }
}

#[async_trait]
impl Component for ManagementDriver {
    fn name(&self) -> &'static str {
        "management"
    }

    #[instrument(skip(self, cluster, ctx), fields(name = %cluster.name_any()))]
    async fn reconcile(&self, cluster: &NVMesh, ctx: &ControllerState) -> Result<Outcome> {
        let management = &cluster.spec.management;
        let mongo = &management.mongo_db;
        let enabled = !management.disabled;

        let with_operator = enabled && mongo.use_operator;
        reconcile_manifests(ctx, cluster, self, MONGODB_OPERATOR_ASSETS, false, !with_operator)
            .await?;

        let plain_mongo = enabled && !mongo.external && !mongo.use_operator;
        reconcile_manifests(ctx, cluster, self, MONGODB_ASSETS, false, !plain_mongo).await?;

        self.reconcile_mongo_custom_resource(cluster, ctx, !with_operator)
            .await?;

        if !enabled {
            reconcile_manifests(ctx, cluster, self, MANAGEMENT_ASSETS, true, true).await?;
            return Ok(Outcome::Done);
        }

        let gate = sync_database(cluster, ctx).await?;
        if !gate.is_done() {
            return Ok(gate);
        }

        let applied = reconcile_manifests(ctx, cluster, self, MANAGEMENT_ASSETS, true, false).await?;
        let config_updated = applied.iter().any(|a| {
            a.kind == "ConfigMap" && a.name == MANAGEMENT_CONFIG_MAP && a.applied == Applied::Updated
        });
        if config_updated {
            info!("Management configuration changed, restarting management");
            if let Err(e) = restart_management(ctx, cluster).await {
                warn!("Failed to restart management after a configuration change: {}", e);
            }
        }
        Ok(Outcome::Done)
    }
}

impl ManagementDriver {
    /// The `MongoDB` custom resource; watched so changes made by the MongoDB
    /// operator trigger a reconcile of the cluster
    async fn reconcile_mongo_custom_resource(
        &self,
        cluster: &NVMesh,
        ctx: &ControllerState,
        remove: bool,
    ) -> Result<()> {
        let root = ctx.options.resources_dir.join(MONGODB_CUSTOM_RESOURCE_ASSETS);
        if !root.is_dir() {
            debug!("No MongoDB custom resources under {}", root.display());
            return Ok(());
        }

        for file in manifests::list_manifest_files(&root, false)? {
            let parsed = manifests::load_file(&file)?;
            if let Some(parse_error) = parsed.error {
                return Err(parse_error.into());
            }

            for obj in parsed.objects {
                let applied = if remove {
                    resources::ensure_removed(ctx, cluster, &obj).await
                } else {
                    resources::ensure_exists(ctx, cluster, obj.clone(), self).await
                };
                match applied {
                    Ok(Applied::Removed) | Ok(Applied::Absent) | Ok(Applied::Unsupported) => {}
                    Ok(_) => watch_custom_resource(ctx, cluster, &obj).await?,
                    Err(e) if e.is_no_kind_match() => {
                        debug!(
                            "MongoDB operator CRDs are not installed, skipping {}",
                            obj.name_any()
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Remove MongoDB in every flavour it may have been deployed in
    pub async fn remove_mongo(&self, cluster: &NVMesh, ctx: &ControllerState) -> Result<()> {
        reconcile_manifests(ctx, cluster, self, MONGODB_OPERATOR_ASSETS, false, true).await?;
        self.reconcile_mongo_custom_resource(cluster, ctx, true).await?;
        reconcile_manifests(ctx, cluster, self, MONGODB_ASSETS, false, true).await?;
        Ok(())
    }
}

async fn watch_custom_resource(
    ctx: &ControllerState,
    cluster: &NVMesh,
    obj: &DynamicObject,
) -> Result<()> {
    let gvk = object_gvk(obj)?;
    let stream = ctx
        .store
        .watch(&gvk, cluster.namespace().as_deref(), &obj.name_any())
        .await?;
    ctx.watchers.register(ObjectRef::from_obj(cluster), stream);
    debug!("Watching {} {}", gvk.kind, obj.name_any());
    Ok(())
}

/// `host:port` of the MongoDB the management servers use
pub fn mongo_connection(cluster: &NVMesh) -> String {
    let mongo = &cluster.spec.management.mongo_db;
    if mongo.external {
        mongo.address.clone()
    } else {
        format!(
            "mongo-svc.{}.svc.cluster.local:27017",
            cluster.namespace().unwrap_or_default()
        )
    }
}

/// URI the operator itself connects to
pub fn mongo_uri(cluster: &NVMesh, options: &OperatorOptions) -> String {
    if options.development {
        DEVELOPMENT_MONGO_URI.to_string()
    } else {
        format!("mongodb://{}", mongo_connection(cluster))
    }
}

pub fn management_image(cluster: &NVMesh) -> String {
    format!(
        "{}/{}:{}",
        cluster.spec.management.image_registry, MANAGEMENT_IMAGE, cluster.spec.management.version
    )
}

fn desired_hidden_settings(cluster: &NVMesh) -> HiddenSettings {
    HiddenSettings {
        auto_evict_missing_drive: !cluster.spec.management.disable_auto_evict_missing_drives,
        auto_format_drive: !cluster.spec.management.disable_auto_format_drives,
    }
}

/// Gate management on a reachable, initialized database
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any()))]
async fn sync_database(cluster: &NVMesh, ctx: &ControllerState) -> Result<Outcome> {
    let uri = mongo_uri(cluster, &ctx.options);

    let settings = match ctx.database.global_settings(&uri).await {
        Ok(settings) => settings,
        Err(DatabaseError::NoDocument) => {
            info!("No globalSettings document found in MongoDB - running initDB");
            jobs::ensure_job(ctx, cluster, &init_db_job(cluster)).await?;
            return Ok(Outcome::RequeueAfter(INIT_DB_REQUEUE));
        }
        Err(e) if e.is_unreachable() => {
            info!(
                "Failed to connect to MongoDB. Make sure a PersistentVolume exists for Mongo and that the MongoDB pod is running"
            );
            return Ok(Outcome::RequeueAfter(DB_UNREACHABLE_REQUEUE));
        }
        Err(e) => return Err(e.into()),
    };

    if let Err(e) = jobs::delete_job(ctx, cluster, INIT_DB_JOB).await {
        warn!("Failed to delete {} job: {}", INIT_DB_JOB, e);
    }

    let desired = desired_hidden_settings(cluster);
    if settings.hidden != desired {
        info!(
            "Updating autoFormatDrive={} and autoEvictMissingDrive={} in the DB",
            desired.auto_format_drive, desired.auto_evict_missing_drive
        );
        ctx.database.update_hidden_settings(&uri, desired).await?;

        // management may not be deployed yet
        if let Err(e) = restart_management(ctx, cluster).await {
            debug!("Management restart after settings update failed: {}", e);
        }
    }
    Ok(Outcome::Done)
}

fn init_db_job(cluster: &NVMesh) -> k8s_openapi::api::batch::v1::Job {
    let mut container = job_container(cluster, INIT_DB_JOB, management_image(cluster));
    container.command = Some(vec!["mongo".to_string()]);
    container.args = Some(vec![
        format!("{}/management", mongo_connection(cluster)),
        "/opt/NVMesh/management/initDB.js".to_string(),
    ]);
    new_job(
        cluster,
        INIT_DB_JOB,
        PodSpec::default(),
        container,
        jobs::DATABASE_JOB_BACKOFF_LIMIT,
    )
}

/// Roll the management pods by stamping the pod template
pub async fn restart_management(ctx: &ControllerState, cluster: &NVMesh) -> Result<()> {
    restart_stateful_set(ctx, cluster, MANAGEMENT_STATEFUL_SET).await
}

async fn restart_stateful_set(ctx: &ControllerState, cluster: &NVMesh, name: &str) -> Result<()> {
    let gvk = gvk_of::<StatefulSet>();
    let namespace = cluster.namespace();

    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut obj) = ctx.store.get(&gvk, namespace.as_deref(), name).await? else {
            return Err(Error::ConfigError(format!("StatefulSet {name} not found")));
        };

        let restarted_at = chrono::Utc::now().to_rfc3339();
        with_typed::<StatefulSet, _>(&mut obj, |ss| {
            if let Some(spec) = ss.spec.as_mut() {
                spec.template
                    .metadata
                    .get_or_insert_with(Default::default)
                    .annotations
                    .get_or_insert_with(BTreeMap::new)
                    .insert(RESTARTED_AT_ANNOTATION.to_string(), restarted_at);
            }
            Ok(())
        })?;

        match ctx.store.replace(&obj).await {
            Ok(_) => {
                info!("Restarted StatefulSet {}", name);
                return Ok(());
            }
            Err(e) if e.is_conflict() && attempt < RESTART_ATTEMPTS => {
                debug!("Conflict restarting {}, retrying", name);
            }
            Err(e) => return Err(e),
        }
    }
}

fn require_version(cluster: &NVMesh) -> Result<()> {
    if cluster.spec.management.version.is_empty() {
        return Err(Error::MissingField(
            "Management Version (NVMesh.Spec.Management.Version)".to_string(),
        ));
    }
    Ok(())
}

fn init_management_stateful_set(cluster: &NVMesh, obj: &mut DynamicObject) -> Result<()> {
    require_version(cluster)?;
    let management = &cluster.spec.management;

    with_typed::<StatefulSet, _>(obj, |ss| {
        let Some(spec) = ss.spec.as_mut() else {
            return Ok(());
        };
        spec.replicas = Some(management.replicas);
        if let Some(container) = spec
            .template
            .spec
            .as_mut()
            .and_then(|p| p.containers.first_mut())
        {
            container.image = Some(management_image(cluster));
            add_keep_running_env(cluster, container);
        }
        if let (Some(claim), Some(template)) = (
            management.backups_volume_claim.as_ref(),
            spec.volume_claim_templates.as_mut().and_then(|t| t.first_mut()),
        ) {
            override_claim_spec(template.spec.get_or_insert_with(Default::default), claim);
        }
        Ok(())
    })
}

fn init_mongo_stateful_set(cluster: &NVMesh, obj: &mut DynamicObject) -> Result<()> {
    let data_claim = cluster.spec.management.mongo_db.data_volume_claim.as_ref();

    with_typed::<StatefulSet, _>(obj, |ss| {
        let Some(spec) = ss.spec.as_mut() else {
            return Ok(());
        };
        if let Some(container) = spec
            .template
            .spec
            .as_mut()
            .and_then(|p| p.containers.first_mut())
        {
            container.image = Some(core_image(cluster, MONGO_INSTANCE_IMAGE));
        }
        if let (Some(claim), Some(template)) = (
            data_claim,
            spec.volume_claim_templates.as_mut().and_then(|t| t.first_mut()),
        ) {
            override_claim_spec(template.spec.get_or_insert_with(Default::default), claim);
        }
        Ok(())
    })
}

/// JSON configuration consumed by the management servers
pub fn management_config(cluster: &NVMesh) -> Result<String> {
    let connection = json!({ "hosts": mongo_connection(cluster) });
    let config = json!({
        "loggingLevel": "DEBUG",
        "statisticsCores": 5,
        "useSSL": (!cluster.spec.management.no_ssl).to_string(),
        "mongoConnection": connection,
        "nvmeshMetadataMongoConnection": connection,
        "statisticsMongoConnection": connection,
    });
    Ok(serde_json::to_string_pretty(&config)?)
}

fn init_config_map(cluster: &NVMesh, obj: &mut DynamicObject) -> Result<()> {
    let config = management_config(cluster)?;
    with_typed::<ConfigMap, _>(obj, |cm| {
        let data = cm.data.get_or_insert_with(BTreeMap::new);
        data.insert(
            "configVersion".to_string(),
            cluster.spec.management.version.clone(),
        );
        data.insert("config".to_string(), config);
        Ok(())
    })
}

fn init_gui_service(cluster: &NVMesh, obj: &mut DynamicObject) -> Result<()> {
    let external_ips = &cluster.spec.management.external_ips;
    if external_ips.is_empty() {
        return Ok(());
    }
    with_typed::<Service, _>(obj, |svc| {
        svc.spec.get_or_insert_with(Default::default).external_ips = Some(external_ips.clone());
        Ok(())
    })
}

fn external_ips(obj: &DynamicObject) -> Option<BTreeSet<String>> {
    obj.data
        .pointer("/spec/externalIPs")
        .and_then(Value::as_array)
        .map(|ips| {
            ips.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
}

/// External IPs are compared as sets
fn gui_service_drifted(_cluster: &NVMesh, desired: &DynamicObject, found: &DynamicObject) -> bool {
    match external_ips(desired) {
        Some(expected) => external_ips(found).unwrap_or_default() != expected,
        None => false,
    }
}

fn init_mongo_custom_resource(cluster: &NVMesh, obj: &mut DynamicObject) -> Result<()> {
    if let Some(spec) = obj.data.get_mut("spec").and_then(Value::as_object_mut) {
        spec.insert(
            "replicas".to_string(),
            json!(cluster.spec.management.mongo_db.replicas),
        );
    }
    Ok(())
}
