//! ThanosRuler resource builders
//!
//! Generates the StatefulSet and governing Service of a ThanosRuler. Building
//! is a pure function of the custom resource, the operator configuration and
//! the names of the rule ConfigMaps; repeated builds are identical.

use crate::config::{OperatorConfig, DEFAULT_THANOS_VERSION};
use crate::crd::{statefulset_name, Argument, ThanosRuler, Workload};
use crate::error::{OperatorError, Result};
use crate::k8sutil::{self, DataVolume};
use crate::operator::{
    self, arg, ConfigReloader, Version, DEFAULT_CONTAINER_ANNOTATION, POD_NAME_ENV,
};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, PodSpec, PodTemplateSpec,
    Probe, ResourceRequirements, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Headless service shared by all rulers of a namespace
pub const GOVERNING_SERVICE_NAME: &str = "thanos-ruler-operated";
pub const APP_NAME: &str = "thanos-ruler";
pub const CONTAINER_NAME: &str = "thanos-ruler";
/// Pod label carrying the ruler name
pub const RULER_NAME_LABEL: &str = "thanos-ruler";
/// Label on rule ConfigMaps naming their ruler
pub const RULE_CONFIGMAP_LABEL: &str = "thanos-ruler-name";

const GRPC_PORT: i32 = 10901;
const WEB_PORT: i32 = 10902;
const STORAGE_DIR: &str = "/thanos/data";
const RULES_DIR: &str = "/etc/thanos/rules";
const QUERY_CONFIG_VOLUME: &str = "query-config";
const QUERY_CONFIG_DIR: &str = "/etc/thanos/config/query-config";
const ALERTMANAGER_CONFIG_VOLUME: &str = "alertmanager-config";
const ALERTMANAGER_CONFIG_DIR: &str = "/etc/thanos/config/alertmanager-config";
const REPLICA_LABEL: &str = "thanos_ruler_replica";
const DEFAULT_MEMORY_REQUEST: &str = "200Mi";
const DEFAULT_TERMINATION_GRACE_PERIOD_SECONDS: i64 = 120;

/// Builder for the Kubernetes objects of one ThanosRuler
pub struct RulerBuilder<'a> {
    ruler: &'a ThanosRuler,
    config: &'a OperatorConfig,
    name: String,
    namespace: String,
    image: String,
    version: Version,
}

impl<'a> RulerBuilder<'a> {
    /// Fails when the image or version cannot be resolved.
    pub fn new(ruler: &'a ThanosRuler, config: &'a OperatorConfig) -> Result<Self> {
        let name = ruler
            .metadata
            .name
            .clone()
            .ok_or_else(|| OperatorError::InvalidConfig("ThanosRuler name is required".to_string()))?;
        let namespace = ruler.namespace().ok_or_else(|| {
            OperatorError::InvalidConfig(format!("ThanosRuler {} has no namespace", name))
        })?;
        let common = &ruler.spec.common;
        let (image, version) = operator::resolve_image(
            common.image.as_deref(),
            common.version.as_deref(),
            &config.thanos_default_base_image,
            DEFAULT_THANOS_VERSION,
        )?;
        Ok(Self {
            ruler,
            config,
            name,
            namespace,
            image,
            version,
        })
    }

    /// Version of Thanos the ruler runs
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn statefulset_name(&self) -> String {
        statefulset_name::<ThanosRuler>(&self.name)
    }

    /// Labels selecting the ruler's pods
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        let mut labels = operator::selector_labels(APP_NAME, &self.name);
        labels.insert(RULER_NAME_LABEL.to_string(), self.name.clone());
        labels
    }

    /// Labels identifying the ruler's rule ConfigMaps
    pub fn rule_config_map_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (RULE_CONFIGMAP_LABEL.to_string(), self.name.clone()),
            (
                operator::MANAGED_BY_LABEL.to_string(),
                operator::MANAGED_BY_VALUE.to_string(),
            ),
        ])
    }

    pub fn owner_reference(&self) -> Result<OwnerReference> {
        k8sutil::owner_reference(self.ruler)
    }

    fn data_volume_name(&self) -> String {
        format!("{}-data", self.statefulset_name())
    }

    fn web_url_base(&self) -> String {
        format!("http://{}:{}", self.config.localhost, WEB_PORT)
    }

    fn route_prefix(&self) -> &str {
        self.ruler.spec.route_prefix.as_deref().unwrap_or_default()
    }

    /// Operator-managed arguments in the order Thanos receives them
    fn managed_args(&self) -> Result<Vec<Argument>> {
        let spec = &self.ruler.spec;
        let common = &spec.common;

        if spec.query_endpoints.is_empty() && spec.query_config.is_none() {
            return Err(OperatorError::InvalidConfig(
                "thanos ruler requires query config or at least one query endpoint".to_string(),
            ));
        }

        let mut args = vec![
            arg("data-dir", STORAGE_DIR),
            arg("eval-interval", spec.evaluation_interval.clone()),
            arg("tsdb.retention", spec.retention.clone()),
            arg("label", format!("{}=\"$({})\"", REPLICA_LABEL, POD_NAME_ENV)),
        ];
        // BTreeMap iteration is sorted
        for (key, value) in &spec.labels {
            args.push(arg("label", format!("{}=\"{}\"", key, value)));
        }
        args.push(arg("alert.label-drop", REPLICA_LABEL));
        for label in &spec.alert_drop_labels {
            args.push(arg("alert.label-drop", label.clone()));
        }
        if common.listen_local {
            args.push(arg(
                "http-address",
                format!("{}:{}", self.config.localhost, WEB_PORT),
            ));
        }
        if let Some(level) = common.log_level.as_deref().filter(|l| !l.is_empty() && *l != "info") {
            args.push(arg("log.level", level));
        }
        if let Some(format) = common.log_format.as_deref().filter(|f| !f.is_empty()) {
            args.push(arg("log.format", format));
        }
        args.push(arg("rule-file", format!("{}/*/*.yaml", RULES_DIR)));

        match &spec.query_config {
            Some(secret) => args.push(arg(
                "query.config-file",
                format!("{}/{}", QUERY_CONFIG_DIR, secret.key),
            )),
            None => {
                for endpoint in &spec.query_endpoints {
                    args.push(arg("query", endpoint.clone()));
                }
            }
        }
        match &spec.alertmanagers_config {
            Some(secret) => args.push(arg(
                "alertmanagers.config-file",
                format!("{}/{}", ALERTMANAGER_CONFIG_DIR, secret.key),
            )),
            None => {
                for url in &spec.alertmanagers_url {
                    args.push(arg("alertmanagers.url", url.clone()));
                }
            }
        }

        if let Some(prefix) = &spec.external_prefix {
            args.push(arg("web.external-prefix", prefix.clone()));
        }
        if let Some(prefix) = &spec.route_prefix {
            args.push(arg("web.route-prefix", prefix.clone()));
        }
        if let Some(url) = &spec.alert_query_url {
            args.push(arg("alert.query-url", url.clone()));
        }
        Ok(args)
    }

    /// Full command line after the binary: `rule --flag=value ...`
    pub fn build_args(&self) -> Result<Vec<String>> {
        let managed = self.managed_args()?;
        let mut args = vec!["rule".to_string()];
        args.extend(operator::build_args(
            &managed,
            &self.ruler.spec.common.additional_args,
        )?);
        Ok(args)
    }

    fn resources(&self) -> ResourceRequirements {
        let mut resources = self.ruler.spec.common.resources.clone().unwrap_or_default();
        let requests = resources.requests.get_or_insert_with(BTreeMap::new);
        requests
            .entry("memory".to_string())
            .or_insert_with(|| Quantity(DEFAULT_MEMORY_REQUEST.to_string()));
        resources
    }

    fn rule_mounts(rule_config_maps: &[String]) -> Vec<VolumeMount> {
        rule_config_maps
            .iter()
            .map(|name| VolumeMount {
                name: name.clone(),
                mount_path: format!("{}/{}", RULES_DIR, name),
                ..Default::default()
            })
            .collect()
    }

    fn probe(&self, endpoint: &str) -> Probe {
        Probe {
            http_get: Some(HTTPGetAction {
                path: Some(format!("{}{}", self.route_prefix().trim_end_matches('/'), endpoint)),
                port: IntOrString::String("web".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_container(&self, rule_config_maps: &[String], data: &DataVolume) -> Result<Container> {
        let spec = &self.ruler.spec;
        let common = &spec.common;

        let mut ports = vec![ContainerPort {
            name: Some("grpc".to_string()),
            container_port: GRPC_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }];
        if !common.listen_local {
            ports.push(ContainerPort {
                name: Some("web".to_string()),
                container_port: WEB_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }

        let mut mounts = vec![VolumeMount {
            name: data.name().to_string(),
            mount_path: STORAGE_DIR.to_string(),
            ..Default::default()
        }];
        mounts.extend(Self::rule_mounts(rule_config_maps));
        if spec.query_config.is_some() {
            mounts.push(VolumeMount {
                name: QUERY_CONFIG_VOLUME.to_string(),
                mount_path: QUERY_CONFIG_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }
        if spec.alertmanagers_config.is_some() {
            mounts.push(VolumeMount {
                name: ALERTMANAGER_CONFIG_VOLUME.to_string(),
                mount_path: ALERTMANAGER_CONFIG_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }
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
            env: Some(vec![operator::pod_name_env()]),
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

    fn build_volumes(&self, rule_config_maps: &[String], data: &DataVolume) -> Vec<Volume> {
        let spec = &self.ruler.spec;
        let mut volumes = Vec::new();
        if let DataVolume::Pod(volume) = data {
            volumes.push(volume.clone());
        }
        for name in rule_config_maps {
            volumes.push(Volume {
                name: name.clone(),
                config_map: Some(ConfigMapVolumeSource {
                    name: name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        for (volume, selector) in [
            (QUERY_CONFIG_VOLUME, &spec.query_config),
            (ALERTMANAGER_CONFIG_VOLUME, &spec.alertmanagers_config),
        ] {
            if let Some(secret) = selector {
                volumes.push(Volume {
                    name: volume.to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(secret.name.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            }
        }
        volumes.extend(spec.common.volumes.iter().cloned());
        volumes
    }

    fn build_pod_template(&self, rule_config_maps: &[String], data: &DataVolume) -> Result<PodTemplateSpec> {
        let common = &self.ruler.spec.common;
        let pod_metadata = common.pod_metadata.clone().unwrap_or_default();

        let mut labels = self.config.labels.clone();
        labels.extend(pod_metadata.labels);
        labels.extend(self.selector_labels());

        let mut annotations = pod_metadata.annotations;
        annotations.insert(
            DEFAULT_CONTAINER_ANNOTATION.to_string(),
            CONTAINER_NAME.to_string(),
        );

        let mut containers = vec![self.build_container(rule_config_maps, data)?];
        let mut init_containers = Vec::new();
        if !rule_config_maps.is_empty() {
            let watched: Vec<String> = rule_config_maps
                .iter()
                .map(|name| format!("{}/{}", RULES_DIR, name))
                .collect();
            let reload_url = format!(
                "{}{}/-/reload",
                self.web_url_base(),
                self.route_prefix().trim_end_matches('/')
            );
            containers.push(
                ConfigReloader::new("config-reloader", &self.config.reloader)
                    .listen_local(common.listen_local, &self.config.localhost)
                    .reload_url(reload_url)
                    .watched_directories(watched.clone())
                    .volume_mounts(Self::rule_mounts(rule_config_maps))
                    .log(common.log_level.as_deref(), common.log_format.as_deref())
                    .build(),
            );
            init_containers.push(
                ConfigReloader::new("init-config-reloader", &self.config.reloader)
                    .init_container()
                    .listen_local(common.listen_local, &self.config.localhost)
                    .watched_directories(watched)
                    .volume_mounts(Self::rule_mounts(rule_config_maps))
                    .log(common.log_level.as_deref(), common.log_format.as_deref())
                    .build(),
            );
        }
        let containers = k8sutil::merge_patch_containers(containers, &common.containers)?;
        let init_containers = k8sutil::merge_patch_containers(init_containers, &common.init_containers)?;

        let pod_spec = PodSpec {
            containers,
            init_containers: (!init_containers.is_empty()).then_some(init_containers),
            volumes: Some(self.build_volumes(rule_config_maps, data)),
            image_pull_secrets: (!common.image_pull_secrets.is_empty())
                .then(|| common.image_pull_secrets.clone()),
            node_selector: (!common.node_selector.is_empty()).then(|| common.node_selector.clone()),
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
        };

        Ok(PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            }),
            spec: Some(pod_spec),
        })
    }

    /// Build the StatefulSet mounting `rule_config_maps`.
    ///
    /// The input hash annotation is left to the caller.
    pub fn build_statefulset(&self, rule_config_maps: &[String]) -> Result<StatefulSet> {
        let common = &self.ruler.spec.common;
        let data = k8sutil::data_volume(common.storage.as_ref(), &self.data_volume_name());

        // Labels of the ThanosRuler itself are not propagated: they are not
        // part of the input hash.
        let mut labels = self.config.labels.clone();
        labels.insert(
            operator::MANAGED_BY_LABEL.to_string(),
            operator::MANAGED_BY_VALUE.to_string(),
        );
        let mut annotations = self.ruler.annotations().clone();
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
                replicas: Some(self.ruler.desired_replicas()),
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
                template: self.build_pod_template(rule_config_maps, &data)?,
                volume_claim_templates: claim_templates,
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Build the headless governing service
    pub fn build_governing_service(&self) -> Result<Service> {
        let mut labels = self.config.labels.clone();
        labels.insert("operated-thanos-ruler".to_string(), "true".to_string());

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
                selector: Some(BTreeMap::from([(
                    operator::APP_NAME_LABEL.to_string(),
                    APP_NAME.to_string(),
                )])),
                ports: Some(vec![
                    ServicePort {
                        name: Some("web".to_string()),
                        port: WEB_PORT,
                        target_port: Some(IntOrString::String("web".to_string())),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    },
                    ServicePort {
                        name: Some("grpc".to_string()),
                        port: GRPC_PORT,
                        target_port: Some(IntOrString::String("grpc".to_string())),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        EmbeddedObjectMetadata, EmbeddedPersistentVolumeClaim, StorageSpec, ThanosRulerSpec,
    };
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, SecretKeySelector};

    fn create_test_ruler(name: &str) -> ThanosRuler {
        let mut tr = ThanosRuler::new(
            name,
            ThanosRulerSpec {
                query_endpoints: vec!["dnssrv+_http._tcp.thanos-query.monitoring.svc".to_string()],
                ..Default::default()
            },
        );
        tr.metadata.namespace = Some("monitoring".to_string());
        tr.metadata.uid = Some("uid-1234".to_string());
        tr
    }

    fn container<'a>(sts: &'a StatefulSet, name: &str) -> Option<&'a Container> {
        sts.spec
            .as_ref()?
            .template
            .spec
            .as_ref()?
            .containers
            .iter()
            .find(|c| c.name == name)
    }

    #[test]
    fn test_build_statefulset_defaults() {
        let tr = create_test_ruler("main");
        let config = OperatorConfig::default();
        let builder = RulerBuilder::new(&tr, &config).unwrap();
        let sts = builder.build_statefulset(&[]).unwrap();

        assert_eq!(sts.metadata.name.as_deref(), Some("thanos-ruler-main"));
        let spec = sts.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(Some(spec.service_name.as_str()), Some(GOVERNING_SERVICE_NAME));
        assert_eq!(spec.pod_management_policy.as_deref(), Some("Parallel"));
        let pod = spec.template.spec.as_ref().unwrap();
        assert!(pod.init_containers.is_none());
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.termination_grace_period_seconds, Some(120));

        let main = container(&sts, CONTAINER_NAME).unwrap();
        assert_eq!(main.image.as_deref(), Some("quay.io/thanos/thanos:v0.37.2"));
        assert_eq!(
            main.resources.as_ref().unwrap().requests.as_ref().unwrap()["memory"],
            Quantity("200Mi".to_string())
        );
        let labels = spec.template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert_eq!(labels.get(RULER_NAME_LABEL).map(String::as_str), Some("main"));
        assert_eq!(
            sts.metadata.owner_references.as_ref().unwrap()[0].kind,
            "ThanosRuler"
        );
    }

    #[test]
    fn test_build_args_order() {
        let mut tr = create_test_ruler("main");
        tr.spec.labels = BTreeMap::from([
            ("region".to_string(), "eu".to_string()),
            ("cluster".to_string(), "a".to_string()),
        ]);
        tr.spec.alertmanagers_url = vec!["http://alertmanager:9093".to_string()];
        tr.spec.common.log_level = Some("info".to_string());
        let config = OperatorConfig::default();
        let args = RulerBuilder::new(&tr, &config).unwrap().build_args().unwrap();

        assert_eq!(
            args,
            vec![
                "rule",
                "--data-dir=/thanos/data",
                "--eval-interval=15s",
                "--tsdb.retention=24h",
                "--label=thanos_ruler_replica=\"$(POD_NAME)\"",
                "--label=cluster=\"a\"",
                "--label=region=\"eu\"",
                "--alert.label-drop=thanos_ruler_replica",
                "--rule-file=/etc/thanos/rules/*/*.yaml",
                "--query=dnssrv+_http._tcp.thanos-query.monitoring.svc",
                "--alertmanagers.url=http://alertmanager:9093",
            ]
        );
    }

    #[test]
    fn test_query_config_secret() {
        let mut tr = create_test_ruler("main");
        tr.spec.query_endpoints.clear();
        tr.spec.query_config = Some(SecretKeySelector {
            name: "thanos-query".to_string(),
            key: "query.yaml".to_string(),
            ..Default::default()
        });
        let config = OperatorConfig::default();
        let builder = RulerBuilder::new(&tr, &config).unwrap();
        let args = builder.build_args().unwrap();
        assert!(args.contains(&"--query.config-file=/etc/thanos/config/query-config/query.yaml".to_string()));

        let sts = builder.build_statefulset(&[]).unwrap();
        let volumes = sts.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        assert!(volumes.iter().any(|v| v.name == QUERY_CONFIG_VOLUME));
    }

    #[test]
    fn test_requires_query_source() {
        let mut tr = create_test_ruler("main");
        tr.spec.query_endpoints.clear();
        let config = OperatorConfig::default();
        let err = RulerBuilder::new(&tr, &config)
            .unwrap()
            .build_statefulset(&[])
            .unwrap_err();
        assert!(err.to_string().contains("query endpoint"));
    }

    #[test]
    fn test_additional_args_cannot_override() {
        let mut tr = create_test_ruler("main");
        tr.spec.common.additional_args = vec![Argument {
            name: "eval-interval".to_string(),
            value: Some("1m".to_string()),
        }];
        let config = OperatorConfig::default();
        assert!(RulerBuilder::new(&tr, &config).unwrap().build_args().is_err());
    }

    #[test]
    fn test_rule_config_maps_add_reloader() {
        let tr = create_test_ruler("main");
        let config = OperatorConfig::default();
        let cms = vec!["thanos-ruler-main-rulefiles-0".to_string()];
        let sts = RulerBuilder::new(&tr, &config)
            .unwrap()
            .build_statefulset(&cms)
            .unwrap();

        let reloader = container(&sts, "config-reloader").unwrap();
        let args = reloader.args.as_ref().unwrap();
        assert!(args.contains(&"--reload-url=http://localhost:10902/-/reload".to_string()));
        assert!(args.contains(&"--watched-dir=/etc/thanos/rules/thanos-ruler-main-rulefiles-0".to_string()));

        let pod = sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(pod.init_containers.as_ref().unwrap()[0].name, "init-config-reloader");
        assert!(pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .any(|v| v.name == cms[0]));
    }

    #[test]
    fn test_user_containers_merge_by_name() {
        let mut tr = create_test_ruler("main");
        tr.spec.common.containers = vec![
            Container {
                name: CONTAINER_NAME.to_string(),
                image_pull_policy: Some("Always".to_string()),
                ..Default::default()
            },
            Container {
                name: "sidecar".to_string(),
                image: Some("busybox".to_string()),
                ..Default::default()
            },
        ];
        let config = OperatorConfig::default();
        let sts = RulerBuilder::new(&tr, &config)
            .unwrap()
            .build_statefulset(&[])
            .unwrap();
        let pod = sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(pod.containers.len(), 2);
        let main = &pod.containers[0];
        assert_eq!(main.image_pull_policy.as_deref(), Some("Always"));
        assert!(main.args.is_some());
        assert_eq!(pod.containers[1].name, "sidecar");
    }

    #[test]
    fn test_claim_template_storage() {
        let mut tr = create_test_ruler("main");
        tr.spec.common.storage = Some(StorageSpec {
            volume_claim_template: Some(EmbeddedPersistentVolumeClaim {
                metadata: EmbeddedObjectMetadata::default(),
                spec: PersistentVolumeClaimSpec::default(),
            }),
            ..Default::default()
        });
        let config = OperatorConfig::default();
        let sts = RulerBuilder::new(&tr, &config)
            .unwrap()
            .build_statefulset(&[])
            .unwrap();
        let spec = sts.spec.as_ref().unwrap();
        let templates = spec.volume_claim_templates.as_ref().unwrap();
        assert_eq!(templates[0].metadata.name.as_deref(), Some("thanos-ruler-main-data"));
        let main = container(&sts, CONTAINER_NAME).unwrap();
        assert_eq!(main.volume_mounts.as_ref().unwrap()[0].name, "thanos-ruler-main-data");
    }

    #[test]
    fn test_kubectl_annotations_stripped() {
        let mut tr = create_test_ruler("main");
        tr.metadata.annotations = Some(BTreeMap::from([
            (
                "kubectl.kubernetes.io/last-applied-configuration".to_string(),
                "{}".to_string(),
            ),
            ("team".to_string(), "observability".to_string()),
        ]));
        let config = OperatorConfig::default();
        let sts = RulerBuilder::new(&tr, &config)
            .unwrap()
            .build_statefulset(&[])
            .unwrap();
        let annotations = sts.metadata.annotations.unwrap();
        assert_eq!(annotations.len(), 1);
        assert!(annotations.contains_key("team"));
    }

    #[test]
    fn test_ruler_labels_are_not_propagated() {
        let mut tr = create_test_ruler("main");
        tr.metadata.labels = Some(BTreeMap::from([("team".to_string(), "obs".to_string())]));
        let config = OperatorConfig {
            labels: BTreeMap::from([("env".to_string(), "prod".to_string())]),
            ..Default::default()
        };
        let sts = RulerBuilder::new(&tr, &config)
            .unwrap()
            .build_statefulset(&[])
            .unwrap();
        let labels = sts.metadata.labels.unwrap();
        assert!(!labels.contains_key("team"));
        assert_eq!(labels.get("env").map(String::as_str), Some("prod"));
        assert_eq!(
            labels.get(operator::MANAGED_BY_LABEL).map(String::as_str),
            Some(operator::MANAGED_BY_VALUE)
        );
    }

    #[test]
    fn test_build_is_deterministic() {
        let mut tr = create_test_ruler("main");
        tr.spec.labels = (0..20).map(|i| (format!("k{}", i), format!("v{}", i))).collect();
        let config = OperatorConfig::default();
        let builder = RulerBuilder::new(&tr, &config).unwrap();
        let cms = vec!["a".to_string(), "b".to_string()];
        let first = serde_json::to_vec(&builder.build_statefulset(&cms).unwrap()).unwrap();
        let second = serde_json::to_vec(&builder.build_statefulset(&cms).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_governing_service() {
        let tr = create_test_ruler("main");
        let config = OperatorConfig::default();
        let svc = RulerBuilder::new(&tr, &config)
            .unwrap()
            .build_governing_service()
            .unwrap();
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        let ports: Vec<i32> = spec.ports.unwrap().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![10902, 10901]);
    }
}
