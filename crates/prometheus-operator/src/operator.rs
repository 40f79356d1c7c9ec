//! Synthesis helpers shared by every workload kind
//!
//! Well-known label and annotation keys, image and version resolution,
//! command-line argument building and the config-reloader container.

use crate::config::ReloaderConfig;
use crate::crd::Argument;
use crate::error::{OperatorError, Result};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction,
    ObjectFieldSelector, Probe, ResourceRequirements, SecurityContext, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

pub const APP_NAME_LABEL: &str = "app.kubernetes.io/name";
pub const APP_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "prometheus-operator";

/// Annotation holding the hash of the inputs a StatefulSet was built from
pub const INPUT_HASH_ANNOTATION: &str = "prometheus-operator-input-hash";
/// Annotation naming the container `kubectl logs/exec` use by default
pub const DEFAULT_CONTAINER_ANNOTATION: &str = "kubectl.kubernetes.io/default-container";
/// Annotation assigning an object to one operator instance
pub const CONTROLLER_ID_ANNOTATION: &str = "operator.prometheus.io/controller-id";

pub const POD_NAME_ENV: &str = "POD_NAME";

const CONFIG_RELOADER_PORT: i32 = 8080;
const INIT_CONFIG_RELOADER_PORT: i32 = 8081;

/// `[v]MAJOR[.MINOR[.PATCH]][-pre][+build]`
static VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v?(0|[1-9][0-9]*)(?:\.(0|[1-9][0-9]*))?(?:\.(0|[1-9][0-9]*))?(?:-[0-9A-Za-z.-]+)?(?:\+[0-9A-Za-z.-]+)?$")
        .unwrap()
});

/// Tag of an image reference (`registry:port/repo:tag`)
static IMAGE_TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([\w.:-]+/)?([\w.-]+/)?[\w.-]+(:([\w.-]+))?$").unwrap()
});

/// Release version, ordered by major, minor, patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a version, tolerating a `v` prefix and missing minor/patch parts.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let caps = VERSION_REGEX.captures(trimmed).ok_or_else(|| {
            OperatorError::InvalidConfig(format!("'{}' is not a valid version", input))
        })?;
        let part = |i: usize| -> Result<u64> {
            caps.get(i).map_or(Ok(0), |m| {
                m.as_str().parse().map_err(|_| {
                    OperatorError::InvalidConfig(format!("'{}' is not a valid version", input))
                })
            })
        };
        Ok(Self::new(part(1)?, part(2)?, part(3)?))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Tag of `image`, if it has one.
pub fn image_tag(image: &str) -> Option<&str> {
    IMAGE_TAG_REGEX
        .captures(image)
        .and_then(|c| c.get(4))
        .map(|m| m.as_str())
}

/// Resolve the container image and the version it runs.
///
/// An explicit image wins; otherwise `base:version`. The version is the
/// spec's, else the explicit image's tag when it parses, else `default_version`.
pub fn resolve_image(
    image: Option<&str>,
    version: Option<&str>,
    default_base: &str,
    default_version: &str,
) -> Result<(String, Version)> {
    let version_str = version.filter(|v| !v.trim().is_empty());
    let explicit = image.filter(|i| !i.trim().is_empty());

    let parsed = match (version_str, explicit.and_then(image_tag)) {
        (Some(v), _) => Version::parse(v)?,
        (None, Some(tag)) => match Version::parse(tag) {
            Ok(v) => v,
            Err(_) => Version::parse(default_version)?,
        },
        (None, None) => Version::parse(default_version)?,
    };

    let image = match explicit {
        Some(image) => image.to_string(),
        None => format!("{}:{}", default_base, version_str.unwrap_or(default_version)),
    };
    Ok((image, parsed))
}

/// Names in `managed` that `additional` also sets, directly or negated with `no-`.
pub fn arguments_intersection(managed: &[Argument], additional: &[Argument]) -> Vec<String> {
    // A managed `name=` flag renders an explicitly empty value
    let names: BTreeSet<&str> = managed
        .iter()
        .map(|a| a.name.trim_end_matches('='))
        .collect();
    let mut intersection = Vec::new();
    for arg in additional {
        if names.contains(arg.name.as_str()) {
            intersection.push(arg.name.clone());
            continue;
        }
        let negated = match arg.name.strip_prefix("no-") {
            Some(positive) => positive.to_string(),
            None => format!("no-{}", arg.name),
        };
        if names.contains(negated.as_str()) {
            intersection.push(negated);
        }
    }
    intersection
}

/// Render `--name=value` flags, managed arguments first.
///
/// Fails if an additional argument would override a managed one.
pub fn build_args(managed: &[Argument], additional: &[Argument]) -> Result<Vec<String>> {
    let clash = arguments_intersection(managed, additional);
    if !clash.is_empty() {
        return Err(OperatorError::InvalidConfig(format!(
            "can't set arguments which are already managed by the operator: {}",
            clash.join(",")
        )));
    }
    Ok(managed
        .iter()
        .chain(additional)
        .map(|arg| match arg.value.as_deref() {
            Some(value) if !value.is_empty() => format!("--{}={}", arg.name, value),
            _ => format!("--{}", arg.name),
        })
        .collect())
}

/// Shorthand for a managed argument
pub fn arg(name: &str, value: impl Into<String>) -> Argument {
    Argument {
        name: name.to_string(),
        value: Some(value.into()),
    }
}

/// Labels shared by every managed object of one workload.
///
/// Must stay stable: they end up in the immutable StatefulSet selector.
pub fn selector_labels(app: &str, instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_NAME_LABEL.to_string(), app.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (APP_INSTANCE_LABEL.to_string(), instance.to_string()),
    ])
}

/// `POD_NAME` from the downward API
pub fn pod_name_env() -> EnvVar {
    EnvVar {
        name: POD_NAME_ENV.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "metadata.name".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Non-root, read-only, no-capability container security context
pub fn restricted_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        read_only_root_filesystem: Some(true),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builder of the `prometheus-config-reloader` container
#[derive(Debug, Clone)]
pub struct ConfigReloader<'a> {
    name: &'a str,
    config: &'a ReloaderConfig,
    init_container: bool,
    listen_local: bool,
    local_host: &'a str,
    reload_url: Option<String>,
    config_file: Option<String>,
    watched_directories: Vec<String>,
    volume_mounts: Vec<VolumeMount>,
    log_level: Option<&'a str>,
    log_format: Option<&'a str>,
}

impl<'a> ConfigReloader<'a> {
    pub fn new(name: &'a str, config: &'a ReloaderConfig) -> Self {
        Self {
            name,
            config,
            init_container: false,
            listen_local: false,
            local_host: "localhost",
            reload_url: None,
            config_file: None,
            watched_directories: Vec::new(),
            volume_mounts: Vec::new(),
            log_level: None,
            log_format: None,
        }
    }

    /// Run once at pod start instead of watching
    pub fn init_container(mut self) -> Self {
        self.init_container = true;
        self
    }

    pub fn listen_local(mut self, listen_local: bool, local_host: &'a str) -> Self {
        self.listen_local = listen_local;
        self.local_host = local_host;
        self
    }

    pub fn reload_url(mut self, url: impl Into<String>) -> Self {
        self.reload_url = Some(url.into());
        self
    }

    pub fn config_file(mut self, path: impl Into<String>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    pub fn watched_directories(mut self, directories: Vec<String>) -> Self {
        self.watched_directories = directories;
        self
    }

    pub fn volume_mounts(mut self, mounts: Vec<VolumeMount>) -> Self {
        self.volume_mounts = mounts;
        self
    }

    pub fn log(mut self, level: Option<&'a str>, format: Option<&'a str>) -> Self {
        self.log_level = level;
        self.log_format = format;
        self
    }

    fn resources(&self) -> ResourceRequirements {
        let quantities = |cpu: &str, memory: &str| {
            let mut list = BTreeMap::new();
            if !cpu.is_empty() {
                list.insert("cpu".to_string(), Quantity(cpu.to_string()));
            }
            if !memory.is_empty() {
                list.insert("memory".to_string(), Quantity(memory.to_string()));
            }
            (!list.is_empty()).then_some(list)
        };
        ResourceRequirements {
            requests: quantities(&self.config.cpu_request, &self.config.memory_request),
            limits: quantities(&self.config.cpu_limit, &self.config.memory_limit),
            ..Default::default()
        }
    }

    pub fn build(self) -> Container {
        let mut args = Vec::new();
        let mut ports = Vec::new();

        if self.init_container {
            args.push("--watch-interval=0".to_string());
        }
        if self.listen_local {
            args.push(format!(
                "--listen-address={}:{}",
                self.local_host, CONFIG_RELOADER_PORT
            ));
        } else {
            let port = if self.init_container {
                INIT_CONFIG_RELOADER_PORT
            } else {
                CONFIG_RELOADER_PORT
            };
            args.push(format!("--listen-address=:{}", port));
            ports.push(ContainerPort {
                name: Some("reloader-web".to_string()),
                container_port: port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }
        if let Some(url) = &self.reload_url {
            args.push(format!("--reload-url={}", url));
        }
        if let Some(file) = &self.config_file {
            args.push(format!("--config-file={}", file));
        }
        for dir in &self.watched_directories {
            args.push(format!("--watched-dir={}", dir));
        }
        if let Some(level) = self.log_level.filter(|l| !l.is_empty() && *l != "info") {
            args.push(format!("--log-level={}", level));
        }
        if let Some(format) = self.log_format.filter(|f| !f.is_empty() && *f != "logfmt") {
            args.push(format!("--log-format={}", format));
        }

        let probe = (!self.init_container && self.config.enable_probes && !self.listen_local)
            .then(|| Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/healthz".to_string()),
                    port: IntOrString::Int(CONFIG_RELOADER_PORT),
                    ..Default::default()
                }),
                ..Default::default()
            });

        Container {
            name: self.name.to_string(),
            image: Some(self.config.image.clone()),
            command: Some(vec!["/bin/prometheus-config-reloader".to_string()]),
            args: Some(args),
            env: Some(vec![pod_name_env()]),
            ports: (!ports.is_empty()).then_some(ports),
            volume_mounts: (!self.volume_mounts.is_empty()).then(|| self.volume_mounts.clone()),
            resources: Some(self.resources()),
            termination_message_policy: Some("FallbackToLogsOnError".to_string()),
            security_context: Some(restricted_security_context()),
            liveness_probe: probe.clone(),
            readiness_probe: probe,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, Option<&str>)]) -> Vec<Argument> {
        pairs
            .iter()
            .map(|(name, value)| Argument {
                name: name.to_string(),
                value: value.map(str::to_string),
            })
            .collect()
    }

    #[test]
    fn test_version_parse() {
        assert_eq!(Version::parse("v0.37.2").unwrap(), Version::new(0, 37, 2));
        assert_eq!(Version::parse("0.26").unwrap(), Version::new(0, 26, 0));
        assert_eq!(Version::parse("1.2.3-rc.1+build").unwrap(), Version::new(1, 2, 3));
        assert!(Version::parse("latest").is_err());
        assert!(Version::parse("1.2.3.4").is_err());
        assert!(Version::new(0, 26, 0) > Version::new(0, 9, 9));
    }

    #[test]
    fn test_resolve_image() {
        let (image, version) =
            resolve_image(None, None, "quay.io/thanos/thanos", "v0.37.2").unwrap();
        assert_eq!(image, "quay.io/thanos/thanos:v0.37.2");
        assert_eq!(version, Version::new(0, 37, 2));

        let (image, version) =
            resolve_image(None, Some("v0.36.0"), "quay.io/thanos/thanos", "v0.37.2").unwrap();
        assert_eq!(image, "quay.io/thanos/thanos:v0.36.0");
        assert_eq!(version, Version::new(0, 36, 0));

        let (image, version) = resolve_image(
            Some("registry:5000/thanos:v0.30.1"),
            None,
            "quay.io/thanos/thanos",
            "v0.37.2",
        )
        .unwrap();
        assert_eq!(image, "registry:5000/thanos:v0.30.1");
        assert_eq!(version, Version::new(0, 30, 1));

        assert!(resolve_image(None, Some("banana"), "thanos", "v0.37.2").is_err());
    }

    #[test]
    fn test_image_tag() {
        assert_eq!(image_tag("quay.io/thanos/thanos:v0.37.2"), Some("v0.37.2"));
        assert_eq!(image_tag("quay.io/thanos/thanos"), None);
    }

    #[test]
    fn test_build_args() {
        let managed = args(&[("data-dir", Some("/data")), ("rule", None)]);
        let extra = args(&[("query.timeout", Some("1m"))]);
        assert_eq!(
            build_args(&managed, &extra).unwrap(),
            vec!["--data-dir=/data", "--rule", "--query.timeout=1m"]
        );
    }

    #[test]
    fn test_build_args_rejects_managed_names() {
        let managed = args(&[("data-dir", Some("/data")), ("web.enable-lifecycle", None)]);
        let err = build_args(&managed, &args(&[("data-dir", Some("/tmp"))])).unwrap_err();
        assert!(err.to_string().contains("data-dir"));

        let negated = args(&[("no-web.enable-lifecycle", None)]);
        assert_eq!(
            arguments_intersection(&managed, &negated),
            vec!["web.enable-lifecycle"]
        );
    }

    #[test]
    fn test_config_reloader_sidecar() {
        let config = ReloaderConfig::default();
        let container = ConfigReloader::new("config-reloader", &config)
            .reload_url("http://localhost:10902/-/reload")
            .watched_directories(vec!["/etc/thanos/rules/a".to_string()])
            .log(Some("debug"), Some("logfmt"))
            .build();

        let args = container.args.unwrap();
        assert_eq!(
            args,
            vec![
                "--listen-address=:8080",
                "--reload-url=http://localhost:10902/-/reload",
                "--watched-dir=/etc/thanos/rules/a",
                "--log-level=debug",
            ]
        );
        assert_eq!(container.ports.unwrap()[0].container_port, 8080);
        let resources = container.resources.unwrap();
        assert_eq!(
            resources.requests.unwrap().get("memory"),
            Some(&Quantity("50Mi".to_string()))
        );
        assert!(container.liveness_probe.is_none());
    }

    #[test]
    fn test_config_reloader_init_container() {
        let config = ReloaderConfig {
            enable_probes: true,
            ..Default::default()
        };
        let container = ConfigReloader::new("init-config-reloader", &config)
            .init_container()
            .build();
        let args = container.args.unwrap();
        assert_eq!(args[0], "--watch-interval=0");
        assert_eq!(args[1], "--listen-address=:8081");
        assert!(container.readiness_probe.is_none());
    }
}
