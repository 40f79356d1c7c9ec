//! Alertmanager resource builders

use crate::config::{OperatorConfig, DEFAULT_ALERTMANAGER_VERSION};
use crate::crd::{statefulset_name, Alertmanager, Argument, Workload};
use crate::error::{OperatorError, Result};
use crate::k8sutil::{self, DataVolume};
use crate::operator::{self, arg, ConfigReloader, Version, DEFAULT_CONTAINER_ANNOTATION};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, SecretVolumeSource, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

pub const GOVERNING_SERVICE_NAME: &str = "alertmanager-operated";
pub const APP_NAME: &str = "alertmanager";
pub const CONTAINER_NAME: &str = "alertmanager";
/// Pod label carrying the Alertmanager name
pub const ALERTMANAGER_NAME_LABEL: &str = "alertmanager";

const WEB_PORT: i32 = 9093;
const MESH_PORT: i32 = 9094;
const STORAGE_DIR: &str = "/alertmanager";
const CONFIG_VOLUME: &str = "config-volume";
const CONFIG_DIR: &str = "/etc/alertmanager/config";
const CONFIG_FILE: &str = "alertmanager.yaml";
const POD_IP_ENV: &str = "POD_IP";
const DEFAULT_MEMORY_REQUEST: &str = "200Mi";
const DEFAULT_TERMINATION_GRACE_PERIOD_SECONDS: i64 = 120;

const MIN_VERSION_LOG_FORMAT: Version = Version::new(0, 16, 0);
const MIN_VERSION_CLUSTER_LABEL: Version = Version::new(0, 26, 0);

/// Builder for the Kubernetes objects of one Alertmanager
pub struct AlertmanagerBuilder<'a> {
    alertmanager: &'a Alertmanager,
    config: &'a OperatorConfig,
    name: String,
    namespace: String,
    image: String,
    version: Version,
}

impl<'a> AlertmanagerBuilder<'a> {
    pub fn new(alertmanager: &'a Alertmanager, config: &'a OperatorConfig) -> Result<Self> {
        let name = alertmanager.metadata.name.clone().ok_or_else(|| {
            OperatorError::InvalidConfig("Alertmanager name is required".to_string())
        })?;
        let namespace = alertmanager.namespace().ok_or_else(|| {
            OperatorError::InvalidConfig(format!("Alertmanager {} has no namespace", name))
        })?;
        let common = &alertmanager.spec.common;
        let (image, version) = operator::resolve_image(
            common.image.as_deref(),
            common.version.as_deref(),
            &config.alertmanager_default_base_image,
            DEFAULT_ALERTMANAGER_VERSION,
        )?;
        Ok(Self {
            alertmanager,
            config,
            name,
            namespace,
            image,
            version,
        })
    }

    pub fn statefulset_name(&self) -> String {
        statefulset_name::<Alertmanager>(&self.name)
    }

    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        let mut labels = operator::selector_labels(APP_NAME, &self.name);
        labels.insert(ALERTMANAGER_NAME_LABEL.to_string(), self.name.clone());
        labels
    }

    pub fn owner_reference(&self) -> Result<OwnerReference> {
        k8sutil::owner_reference(self.alertmanager)
    }

    /// Name of the Secret holding the Alertmanager configuration
    pub fn config_secret_name(&self) -> String {
        self.alertmanager
            .spec
            .config_secret
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.statefulset_name())
    }

    fn route_prefix(&self) -> &str {
        self.alertmanager
            .spec
            .route_prefix
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or("/")
    }

    fn managed_args(&self) -> Vec<Argument> {
        let spec = &self.alertmanager.spec;
        let common = &spec.common;

        let mut args = vec![
            arg("config.file", format!("{}/{}", CONFIG_DIR, CONFIG_FILE)),
            arg("storage.path", STORAGE_DIR),
            arg("data.retention", spec.retention.clone()),
        ];
        let replicas = self.alertmanager.desired_replicas();
        if replicas == 1 {
            // Gossip is disabled by an explicitly empty address
            args.push(Argument {
                name: "cluster.listen-address=".to_string(),
                value: None,
            });
        } else {
            args.push(arg(
                "cluster.listen-address",
                format!("[$({})]:{}", POD_IP_ENV, MESH_PORT),
            ));
        }
        let web_listen = if common.listen_local {
            format!("{}:{}", self.config.localhost, WEB_PORT)
        } else {
            format!(":{}", WEB_PORT)
        };
        args.push(arg("web.listen-address", web_listen));
        if let Some(url) = spec.external_url.as_deref().filter(|u| !u.is_empty()) {
            args.push(arg("web.external-url", url));
        }
        args.push(arg("web.route-prefix", self.route_prefix()));

        if let Some(level) = common.log_level.as_deref().filter(|l| !l.is_empty() && *l != "info") {
            args.push(arg("log.level", level));
        }
        if self.version >= MIN_VERSION_LOG_FORMAT {
            if let Some(format) = common.log_format.as_deref().filter(|f| !f.is_empty() && *f != "logfmt") {
                args.push(arg("log.format", format));
            }
        }
        if self.version >= MIN_VERSION_CLUSTER_LABEL {
            let label = spec
                .cluster_label
                .clone()
                .unwrap_or_else(|| format!("{}/{}", self.namespace, self.name));
            args.push(arg("cluster.label", label));
        }

        for i in 0..replicas.max(0) {
            args.push(arg(
                "cluster.peer",
                format!(
                    "{}-{}.{}:{}",
                    self.statefulset_name(),
                    i,
                    GOVERNING_SERVICE_NAME,
                    MESH_PORT
                ),
            ));
        }
        for peer in &spec.additional_peers {
            args.push(arg("cluster.peer", peer.clone()));
        }
        args
    }

    pub fn build_args(&self) -> Result<Vec<String>> {
        operator::build_args(
            &self.managed_args(),
            &self.alertmanager.spec.common.additional_args,
        )
    }

    fn resources(&self) -> ResourceRequirements {
        let mut resources = self
            .alertmanager
            .spec
            .common
            .resources
            .clone()
            .unwrap_or_default();
        resources
            .requests
            .get_or_insert_with(BTreeMap::new)
            .entry("memory".to_string())
            .or_insert_with(|| Quantity(DEFAULT_MEMORY_REQUEST.to_string()));
        resources
    }

    fn probe(&self, endpoint: &str) -> Probe {
        Probe {
            http_get: Some(HTTPGetAction {
                path: Some(format!("{}{}", self.route_prefix().trim_end_matches('/'), endpoint)),
                port: IntOrString::String("web".to_string()),
                ..Default::default()
            }),
            failure_threshold: Some(10),
            ..Default::default()
        }
    }

    fn config_mount() -> VolumeMount {
        VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        }
    }

    fn build_container(&self, data: &DataVolume) -> Result<Container> {
        let common = &self.alertmanager.spec.common;

        let mut ports = Vec::new();
        if !common.listen_local {
            ports.push(ContainerPort {
                name: Some("web".to_string()),
                container_port: WEB_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }
        for (name, protocol) in [("mesh-tcp", "TCP"), ("mesh-udp", "UDP")] {
            ports.push(ContainerPort {
                name: Some(name.to_string()),
                container_port: MESH_PORT,
                protocol: Some(protocol.to_string()),
                ..Default::default()
            });
        }

        let mut mounts = vec![
            Self::config_mount(),
            VolumeMount {
                name: data.name().to_string(),
                mount_path: STORAGE_DIR.to_string(),
                ..Default::default()
            },
        ];
        mounts.extend(common.volume_mounts.iter().cloned());

        let (liveness, readiness) = if common.listen_local {
            (None, None)
        } else {
            (Some(self.probe("/-/healthy")), Some(self.probe("/-/ready")))
        };

        Ok(Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(self.image.clone()),
            image_pull_policy: common.image_pull_policy.clone(),
            args: Some(self.build_args()?),
            env: Some(vec![EnvVar {
                name: POD_IP_ENV.to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "status.podIP".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ports: Some(ports),
            resources: Some(self.resources()),
            volume_mounts: Some(mounts),
            liveness_probe: liveness,
            readiness_probe: readiness,
            termination_message_policy: Some("FallbackToLogsOnError".to_string()),
            security_context: Some(operator::restricted_security_context()),
            ..Default::default()
        })
    }

    fn build_pod_template(&self, data: &DataVolume) -> Result<PodTemplateSpec> {
        let common = &self.alertmanager.spec.common;
        let pod_metadata = common.pod_metadata.clone().unwrap_or_default();

        let mut labels = self.config.labels.clone();
        labels.extend(pod_metadata.labels);
        labels.extend(self.selector_labels());

        let mut annotations = pod_metadata.annotations;
        annotations.insert(
            DEFAULT_CONTAINER_ANNOTATION.to_string(),
            CONTAINER_NAME.to_string(),
        );

        let reload_url = format!(
            "http://{}:{}{}/-/reload",
            self.config.localhost,
            WEB_PORT,
            self.route_prefix().trim_end_matches('/')
        );
        let reloader = ConfigReloader::new("config-reloader", &self.config.reloader)
            .listen_local(common.listen_local, &self.config.localhost)
            .reload_url(reload_url)
            .watched_directories(vec![CONFIG_DIR.to_string()])
            .volume_mounts(vec![Self::config_mount()])
            .log(common.log_level.as_deref(), common.log_format.as_deref())
            .build();

        let containers = k8sutil::merge_patch_containers(
            vec![self.build_container(data)?, reloader],
            &common.containers,
        )?;
        let init_containers = k8sutil::merge_patch_containers(Vec::new(), &common.init_containers)?;

        let mut volumes = vec![Volume {
            name: CONFIG_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(self.config_secret_name()),
                ..Default::default()
            }),
            ..Default::default()
        }];
        if let DataVolume::Pod(volume) = data {
            volumes.push(volume.clone());
        }
        volumes.extend(common.volumes.iter().cloned());

        Ok(PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers,
                init_containers: (!init_containers.is_empty()).then_some(init_containers),
                volumes: Some(volumes),
                image_pull_secrets: (!common.image_pull_secrets.is_empty())
                    .then(|| common.image_pull_secrets.clone()),
                node_selector: (!common.node_selector.is_empty())
                    .then(|| common.node_selector.clone()),
                tolerations: (!common.tolerations.is_empty()).then(|| common.tolerations.clone()),
                affinity: common.affinity.clone(),
                security_context: common.security_context.clone(),
                service_account_name: common.service_account_name.clone(),
                priority_class_name: common.priority_class_name.clone(),
                termination_grace_period_seconds: Some(
                    common
                        .termination_grace_period_seconds
                        .unwrap_or(DEFAULT_TERMINATION_GRACE_PERIOD_SECONDS),
                ),
                ..Default::default()
            }),
        })
    }

    /// Build the StatefulSet; the input hash annotation is left to the caller.
    pub fn build_statefulset(&self) -> Result<StatefulSet> {
        let common = &self.alertmanager.spec.common;
        let data = k8sutil::data_volume(
            common.storage.as_ref(),
            &format!("{}-db", self.statefulset_name()),
        );

        let mut labels = self.config.labels.clone();
        labels.insert(
            operator::MANAGED_BY_LABEL.to_string(),
            operator::MANAGED_BY_VALUE.to_string(),
        );
        let mut annotations = self.alertmanager.annotations().clone();
        annotations.extend(self.config.annotations.clone());
        k8sutil::strip_kubectl_annotations(&mut annotations);

        let claim_templates = match &data {
            DataVolume::ClaimTemplate(pvc) => Some(vec![pvc.clone()]),
            DataVolume::Pod(_) => None,
        };

        Ok(StatefulSet {
            metadata: ObjectMeta {
                name: Some(self.statefulset_name()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                owner_references: Some(vec![self.owner_reference()?]),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                service_name: GOVERNING_SERVICE_NAME.to_string(),
                replicas: Some(self.alertmanager.desired_replicas()),
                min_ready_seconds: common.min_ready_seconds,
                pod_management_policy: Some("Parallel".to_string()),
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    ..Default::default()
                }),
                selector: LabelSelector {
                    match_labels: Some(self.selector_labels()),
                    ..Default::default()
                },
                template: self.build_pod_template(&data)?,
                volume_claim_templates: claim_templates,
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Build the headless governing service shared by the namespace's Alertmanagers
    pub fn build_governing_service(&self) -> Result<Service> {
        let mut labels = self.config.labels.clone();
        labels.insert("operated-alertmanager".to_string(), "true".to_string());

        let port = |name: &str, port: i32, target: &str, protocol: &str| ServicePort {
            name: Some(name.to_string()),
            port,
            target_port: Some(IntOrString::String(target.to_string())),
            protocol: Some(protocol.to_string()),
            ..Default::default()
        };

        Ok(Service {
            metadata: ObjectMeta {
                name: Some(GOVERNING_SERVICE_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                annotations: (!self.config.annotations.is_empty())
                    .then(|| self.config.annotations.clone()),
                owner_references: Some(vec![self.owner_reference()?]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                publish_not_ready_addresses: Some(true),
                selector: Some(BTreeMap::from([(
                    operator::APP_NAME_LABEL.to_string(),
                    APP_NAME.to_string(),
                )])),
                ports: Some(vec![
                    port("web", WEB_PORT, "web", "TCP"),
                    port("tcp-mesh", MESH_PORT, "mesh-tcp", "TCP"),
                    port("udp-mesh", MESH_PORT, "mesh-udp", "UDP"),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}
