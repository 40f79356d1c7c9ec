//! Rule selection and sharding
//!
//! `PrometheusRule` objects are selected through a namespace selector and a
//! rule label selector, validated, relabelled for namespace enforcement and
//! rendered into rule files. The files are packed into as few ConfigMaps as
//! the size ceiling allows, and those ConfigMaps are synced against the
//! cluster as a whole set on every pass.

use crate::cache::{Cache, ObjectKey};
use crate::client::ClusterClient;
use crate::crd::{ExcludedRuleReference, PrometheusRule, PrometheusRuleSpec, GROUP, PROMETHEUS_RULES_RESOURCE};
use crate::error::{OperatorError, Result};
use crate::k8sutil;
use crate::operator::Version;
use crate::selector::SelectorCriteria;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::ResourceExt;
use promql_parser::label::{MatchOp, Matcher, Matchers};
use promql_parser::parser::{self as promql, Expr};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

/// Annotation holding the digest of a shard's data
pub const RULE_CONTENT_HASH_ANNOTATION: &str = "prometheus-operator-rulefiles-hash";

static METRIC_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").unwrap());

static LABEL_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap());

/// First Thanos release honouring the group `limit` field
const THANOS_MIN_VERSION_LIMIT: Version = Version::new(0, 24, 0);
/// First Thanos release honouring `keep_firing_for`
const THANOS_MIN_VERSION_KEEP_FIRING_FOR: Version = Version::new(0, 34, 0);

/// Namespaces a rule selection draws from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceSelection {
    /// Every namespace except the denied ones
    All { denied: BTreeSet<String> },
    /// An explicit, sorted list
    Only(Vec<String>),
}

impl NamespaceSelection {
    pub fn contains(&self, namespace: &str) -> bool {
        match self {
            NamespaceSelection::All { denied } => !denied.contains(namespace),
            NamespaceSelection::Only(namespaces) => {
                namespaces.iter().any(|ns| ns == namespace)
            }
        }
    }
}

/// Resolve a rule namespace selector against the cached namespaces.
///
/// No selector means the owner's namespace only; an empty one means all
/// namespaces the operator watches.
pub fn select_namespaces(
    owner_namespace: &str,
    selector: Option<&LabelSelector>,
    namespaces: &Cache<Namespace>,
    watched_namespace: Option<&str>,
    denied: &BTreeSet<String>,
) -> Result<NamespaceSelection> {
    let Some(selector) = selector else {
        return Ok(NamespaceSelection::Only(vec![owner_namespace.to_string()]));
    };
    let criteria = SelectorCriteria::from_label_selector(Some(selector))?;

    if let Some(watched) = watched_namespace {
        let selected = !denied.contains(watched)
            && (criteria.is_everything()
                || namespaces
                    .get_by_name(watched)
                    .is_some_and(|ns| criteria.matches(ns.labels())));
        let only = if selected {
            vec![watched.to_string()]
        } else {
            Vec::new()
        };
        return Ok(NamespaceSelection::Only(only));
    }

    if criteria.is_everything() {
        return Ok(NamespaceSelection::All {
            denied: denied.clone(),
        });
    }

    Ok(NamespaceSelection::Only(
        namespaces
            .list(None, &criteria)
            .iter()
            .map(|ns| ns.name_any())
            .filter(|name| !denied.contains(name))
            .collect(),
    ))
}

/// Whether a rule namespace selector selects `namespace` with `labels`.
pub fn selects_namespace(
    owner_namespace: &str,
    selector: Option<&LabelSelector>,
    namespace: &str,
    labels: &BTreeMap<String, String>,
) -> Result<bool> {
    match selector {
        None => Ok(owner_namespace == namespace),
        Some(selector) => Ok(SelectorCriteria::from_label_selector(Some(selector))?.matches(labels)),
    }
}

/// Rewrites rules so that every series carries its source namespace
///
/// The enforced label is set on each rule and added as an equality matcher
/// to every vector selector of its expression, replacing any matcher on the
/// same label.
#[derive(Debug, Clone, Default)]
pub struct NamespaceLabeler {
    enforced_label: Option<String>,
    /// `(namespace, group/resource)` to exempted names; `""` exempts all
    exclusions: BTreeMap<(String, String), Vec<String>>,
}

impl NamespaceLabeler {
    pub fn new(enforced_label: Option<&str>, exclusions: &[ExcludedRuleReference]) -> Self {
        let mut map: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
        for exclusion in exclusions {
            map.entry((
                exclusion.namespace.clone(),
                format!("{}/{}", exclusion.group, exclusion.resource),
            ))
            .or_default()
            .push(exclusion.name.clone().unwrap_or_default());
        }
        Self {
            enforced_label: enforced_label
                .filter(|l| !l.is_empty())
                .map(str::to_string),
            exclusions: map,
        }
    }

    /// Whether the rule `namespace/name` is exempt from enforcement.
    pub fn is_excluded(&self, namespace: &str, name: &str) -> bool {
        let resource = format!("{}/{}", GROUP, PROMETHEUS_RULES_RESOURCE);
        self.exclusions
            .get(&(namespace.to_string(), resource))
            .is_some_and(|names| names.iter().any(|n| n.is_empty() || n == name))
    }

    /// Enforce the label on every rule of `spec`; fails on an unparsable expression.
    pub fn enforce(&self, namespace: &str, name: &str, spec: &mut PrometheusRuleSpec) -> Result<()> {
        let Some(label) = &self.enforced_label else {
            return Ok(());
        };
        if self.is_excluded(namespace, name) {
            return Ok(());
        }
        for group in &mut spec.groups {
            for rule in &mut group.rules {
                let mut expr = promql::parse(&rule.expr).map_err(|e| {
                    OperatorError::RuleValidation(format!(
                        "group '{}': invalid expr '{}': {}",
                        group.name, rule.expr, e
                    ))
                })?;
                inject_matcher(&mut expr, label, namespace);
                rule.expr = expr.to_string();
                rule.labels.insert(label.clone(), namespace.to_string());
            }
        }
        Ok(())
    }
}

fn inject_matcher(expr: &mut Expr, label: &str, value: &str) {
    match expr {
        Expr::VectorSelector(vs) => enforce_matcher(&mut vs.matchers, label, value),
        Expr::MatrixSelector(ms) => enforce_matcher(&mut ms.vs.matchers, label, value),
        Expr::Aggregate(agg) => {
            inject_matcher(&mut agg.expr, label, value);
            if let Some(param) = agg.param.as_mut() {
                inject_matcher(param, label, value);
            }
        }
        Expr::Binary(bin) => {
            inject_matcher(&mut bin.lhs, label, value);
            inject_matcher(&mut bin.rhs, label, value);
        }
        Expr::Unary(unary) => inject_matcher(&mut unary.expr, label, value),
        Expr::Paren(paren) => inject_matcher(&mut paren.expr, label, value),
        Expr::Subquery(sq) => inject_matcher(&mut sq.expr, label, value),
        Expr::Call(call) => {
            for arg in call.args.args.iter_mut() {
                inject_matcher(arg, label, value);
            }
        }
        _ => {}
    }
}

fn enforce_matcher(matchers: &mut Matchers, label: &str, value: &str) {
    let enforced = || Matcher {
        op: MatchOp::Equal,
        name: label.to_string(),
        value: value.to_string(),
    };
    matchers.matchers.retain(|m| m.name != label);
    matchers.matchers.push(enforced());
    for alternative in &mut matchers.or_matchers {
        alternative.retain(|m| m.name != label);
        alternative.push(enforced());
    }
}

/// Drop empty optional strings and fields the Thanos version ignores.
pub fn sanitize_for_thanos(spec: &mut PrometheusRuleSpec, version: Version) {
    fn blank_to_none(field: &mut Option<String>) {
        if field.as_deref().is_some_and(|v| v.trim().is_empty()) {
            *field = None;
        }
    }

    for group in &mut spec.groups {
        blank_to_none(&mut group.interval);
        blank_to_none(&mut group.partial_response_strategy);
        if group.limit.is_some() && version < THANOS_MIN_VERSION_LIMIT {
            debug!(group = %group.name, %version, "Ignoring `limit` unsupported by Thanos");
            group.limit = None;
        }
        // Not supported by any Thanos release
        group.query_offset = None;
        group.labels.clear();

        for rule in &mut group.rules {
            blank_to_none(&mut rule.for_);
            blank_to_none(&mut rule.keep_firing_for);
            if rule.keep_firing_for.is_some() && version < THANOS_MIN_VERSION_KEEP_FIRING_FOR {
                rule.keep_firing_for = None;
            }
        }
    }
}

fn check_duration(errors: &mut Vec<String>, context: &str, field: &str, value: Option<&str>) {
    if let Some(value) = value {
        if !crate::crd::is_valid_duration(value) {
            errors.push(format!("{}: invalid {} '{}'", context, field, value));
        }
    }
}

fn check_label_names<'a>(
    errors: &mut Vec<String>,
    context: &str,
    what: &str,
    names: impl IntoIterator<Item = &'a String>,
) {
    for name in names {
        if !LABEL_NAME_REGEX.is_match(name) {
            errors.push(format!("{}: invalid {} name '{}'", context, what, name));
        }
    }
}

/// Check a rule document; returns every problem found.
pub fn validate_rule_spec(spec: &PrometheusRuleSpec) -> std::result::Result<(), Vec<String>> {
    let mut errors = Vec::new();
    let mut group_names = HashSet::new();

    for (gi, group) in spec.groups.iter().enumerate() {
        let gctx = format!("group {}", gi);
        if group.name.trim().is_empty() {
            errors.push(format!("{}: name must not be empty", gctx));
        } else if !group_names.insert(group.name.as_str()) {
            errors.push(format!("{}: duplicate group name '{}'", gctx, group.name));
        }
        check_duration(&mut errors, &gctx, "interval", group.interval.as_deref());
        check_duration(&mut errors, &gctx, "query_offset", group.query_offset.as_deref());
        if group.limit.is_some_and(|l| l < 0) {
            errors.push(format!("{}: limit must not be negative", gctx));
        }
        if let Some(strategy) = &group.partial_response_strategy {
            if !matches!(strategy.to_ascii_lowercase().as_str(), "" | "warn" | "abort") {
                errors.push(format!(
                    "{}: invalid partial_response_strategy '{}' (want warn or abort)",
                    gctx, strategy
                ));
            }
        }
        check_label_names(&mut errors, &gctx, "label", group.labels.keys());

        for (ri, rule) in group.rules.iter().enumerate() {
            let rctx = format!("group '{}' rule {}", group.name, ri);
            match (&rule.record, &rule.alert) {
                (Some(_), Some(_)) => {
                    errors.push(format!("{}: only one of 'record' and 'alert' may be set", rctx))
                }
                (None, None) => {
                    errors.push(format!("{}: one of 'record' or 'alert' must be set", rctx))
                }
                (Some(record), None) => {
                    if !METRIC_NAME_REGEX.is_match(record) {
                        errors.push(format!("{}: invalid recording rule name '{}'", rctx, record));
                    }
                    if rule.for_.is_some() {
                        errors.push(format!("{}: recording rules cannot set 'for'", rctx));
                    }
                    if rule.keep_firing_for.is_some() {
                        errors.push(format!(
                            "{}: recording rules cannot set 'keep_firing_for'",
                            rctx
                        ));
                    }
                    if !rule.annotations.is_empty() {
                        errors.push(format!("{}: recording rules cannot set annotations", rctx));
                    }
                }
                (None, Some(alert)) => {
                    if alert.trim().is_empty() {
                        errors.push(format!("{}: alert name must not be empty", rctx));
                    }
                }
            }
            if rule.expr.trim().is_empty() {
                errors.push(format!("{}: 'expr' must not be empty", rctx));
            } else if let Err(e) = promql::parse(&rule.expr) {
                errors.push(format!("{}: invalid expr: {}", rctx, e));
            }
            check_duration(&mut errors, &rctx, "for", rule.for_.as_deref());
            check_duration(&mut errors, &rctx, "keep_firing_for", rule.keep_firing_for.as_deref());
            check_label_names(&mut errors, &rctx, "label", rule.labels.keys());
            check_label_names(&mut errors, &rctx, "annotation", rule.annotations.keys());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate `spec` and render it as a rule file no larger than `max_size`.
pub fn render_rule_file(spec: &PrometheusRuleSpec, max_size: usize) -> Result<String> {
    validate_rule_spec(spec).map_err(|errors| OperatorError::RuleValidation(errors.join("; ")))?;
    let content = serde_yaml::to_string(spec)?;
    if content.len() > max_size {
        return Err(OperatorError::RuleValidation(format!(
            "the rendered rule file is {} bytes which is above the maximum of {} bytes",
            content.len(),
            max_size
        )));
    }
    Ok(content)
}

/// Identity of a rendered rule file, ordered by namespace then name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RuleFileId {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl RuleFileId {
    /// ConfigMap key of the file; the UID keeps `a-b/c` and `a/b-c` apart.
    pub fn file_name(&self) -> String {
        format!("{}-{}-{}.yaml", self.namespace, self.name, self.uid)
    }
}

/// Outcome of one rule selection
#[derive(Debug, Clone, Default)]
pub struct RuleSelection {
    files: BTreeMap<RuleFileId, String>,
    rejected: Vec<(ObjectKey, String)>,
}

impl RuleSelection {
    /// `(file name, content)` in packing order.
    pub fn rule_files(&self) -> Vec<(String, String)> {
        self.files
            .iter()
            .map(|(id, content)| (id.file_name(), content.clone()))
            .collect()
    }

    pub fn accepted_len(&self) -> usize {
        self.files.len()
    }

    pub fn rejected_len(&self) -> usize {
        self.rejected.len()
    }

    /// Rejected objects with the reason
    pub fn rejected(&self) -> &[(ObjectKey, String)] {
        &self.rejected
    }
}

/// Selects, validates and renders the rules of one ThanosRuler
pub struct RuleSelector<'a> {
    rules: &'a Cache<PrometheusRule>,
    selector: SelectorCriteria,
    labeler: NamespaceLabeler,
    version: Version,
    max_size: usize,
}

impl<'a> RuleSelector<'a> {
    /// Fails when the rule label selector is malformed.
    pub fn new(
        rules: &'a Cache<PrometheusRule>,
        rule_selector: Option<&LabelSelector>,
        labeler: NamespaceLabeler,
        version: Version,
        max_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            rules,
            selector: SelectorCriteria::from_label_selector(rule_selector)?,
            labeler,
            version,
            max_size,
        })
    }

    pub fn select(&self, namespaces: &NamespaceSelection) -> RuleSelection {
        let candidates: Vec<_> = match namespaces {
            NamespaceSelection::All { .. } => self.rules.list(None, &self.selector),
            NamespaceSelection::Only(list) => list
                .iter()
                .flat_map(|ns| self.rules.list(Some(ns), &self.selector))
                .collect(),
        };

        let mut selection = RuleSelection::default();
        for rule in candidates {
            let namespace = rule.namespace().unwrap_or_default();
            if !namespaces.contains(&namespace) {
                continue;
            }
            let name = rule.name_any();
            let key = ObjectKey::new(&namespace, &name);
            let id = RuleFileId {
                namespace,
                name,
                uid: rule.uid().unwrap_or_default(),
            };

            match self.render(&id, &rule.spec) {
                Ok(content) => {
                    selection.files.insert(id, content);
                }
                Err(e) => {
                    warn!(prometheusrule = %key, error = %e, "Skipping invalid PrometheusRule");
                    selection.rejected.push((key, e.to_string()));
                }
            }
        }

        debug!(
            accepted = selection.accepted_len(),
            rejected = selection.rejected_len(),
            "Selected PrometheusRules"
        );
        selection
    }

    fn render(&self, id: &RuleFileId, spec: &PrometheusRuleSpec) -> Result<String> {
        let mut spec = spec.clone();
        self.labeler.enforce(&id.namespace, &id.name, &mut spec)?;
        sanitize_for_thanos(&mut spec, self.version);
        let file_name = id.file_name();
        let content = render_rule_file(&spec, self.max_size.saturating_sub(file_name.len()))?;
        Ok(content)
    }
}

/// Pack rule files into shards of at most `max_size` bytes (keys plus values).
///
/// Next-fit over the given order: a file goes into the current shard if it
/// fits, otherwise it opens a new one.
pub fn shard_rule_files(files: &[(String, String)], max_size: usize) -> Vec<BTreeMap<String, String>> {
    let mut shards: Vec<BTreeMap<String, String>> = Vec::new();
    let mut current = BTreeMap::new();
    let mut current_size = 0usize;

    for (name, content) in files {
        let size = name.len() + content.len();
        if !current.is_empty() && current_size + size > max_size {
            shards.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current.insert(name.clone(), content.clone());
        current_size += size;
    }
    if !current.is_empty() {
        shards.push(current);
    }
    shards
}

fn content_hash(data: &BTreeMap<String, String>) -> Result<String> {
    Ok(hex::encode(Sha256::digest(serde_json::to_vec(data)?)))
}

/// The shard ConfigMaps of one owner
#[derive(Debug, Clone)]
pub struct RuleShards<'a> {
    pub namespace: &'a str,
    /// Shards are named `<statefulset>-rulefiles-<i>`
    pub statefulset_name: &'a str,
    /// Labels identifying the owner's shards; also used to list them
    pub selector_labels: BTreeMap<String, String>,
    /// Extra labels and annotations for every shard
    pub labels: &'a BTreeMap<String, String>,
    pub annotations: &'a BTreeMap<String, String>,
    pub owner: OwnerReference,
    pub max_size: usize,
}

impl RuleShards<'_> {
    pub fn shard_name(&self, index: usize) -> String {
        format!("{}-rulefiles-{}", self.statefulset_name, index)
    }

    /// Desired shard ConfigMaps for `files`.
    pub fn build(&self, files: &[(String, String)]) -> Result<Vec<ConfigMap>> {
        shard_rule_files(files, self.max_size)
            .into_iter()
            .enumerate()
            .map(|(index, data)| {
                let mut labels = self.labels.clone();
                labels.extend(self.selector_labels.clone());
                let mut annotations = self.annotations.clone();
                annotations.insert(RULE_CONTENT_HASH_ANNOTATION.to_string(), content_hash(&data)?);
                Ok(ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(self.shard_name(index)),
                        namespace: Some(self.namespace.to_string()),
                        labels: Some(labels),
                        annotations: Some(annotations),
                        owner_references: Some(vec![self.owner.clone()]),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                })
            })
            .collect()
    }

    /// Converge the cluster to the shards for `files`; returns their names.
    ///
    /// Missing shards are created, changed ones updated, and shards carrying
    /// the owner's labels that are no longer wanted deleted.
    pub async fn sync(&self, client: &dyn ClusterClient, files: &[(String, String)]) -> Result<Vec<String>> {
        let desired = self.build(files)?;
        let existing: BTreeMap<String, ConfigMap> = client
            .list_config_maps(self.namespace, &k8sutil::format_label_selector(&self.selector_labels))
            .await?
            .into_iter()
            .map(|cm| (cm.name_any(), cm))
            .collect();

        let mut names = Vec::with_capacity(desired.len());
        for mut cm in desired {
            let name = cm.name_any();
            match existing.get(&name) {
                None => {
                    info!(namespace = %self.namespace, name = %name, "Creating rule ConfigMap");
                    client.create_config_map(&cm).await?;
                }
                Some(live) if live.annotations() == cm.annotations()
                    && live.labels() == cm.labels()
                    && live.data == cm.data => {
                    debug!(namespace = %self.namespace, name = %name, "Rule ConfigMap is up to date");
                }
                Some(live) => {
                    info!(namespace = %self.namespace, name = %name, "Updating rule ConfigMap");
                    cm.metadata.resource_version = live.metadata.resource_version.clone();
                    client.update_config_map(&cm).await?;
                }
            }
            names.push(name);
        }

        for name in existing.keys().filter(|n| !names.contains(n)) {
            info!(namespace = %self.namespace, name = %name, "Deleting stale rule ConfigMap");
            client.delete_config_map(self.namespace, name).await?;
        }
        Ok(names)
    }
}
