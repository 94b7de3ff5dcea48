//! Well-known labels and annotations carried by stack children

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::crd::Stack;

/// Owning stack name; the children index keys objects by this label
pub const STACK_NAME_LABEL: &str = "com.docker.stack.namespace";
pub const SERVICE_NAME_LABEL: &str = "com.docker.service.name";
pub const SERVICE_ID_LABEL: &str = "com.docker.service.id";
/// Secrets/configs carrying this label are never deleted with the stack
pub const EXTERNAL_LABEL: &str = "com.docker.stack.external";

/// Generation the operator expects the object to have after its last write
pub const EXPECTED_GENERATION_ANNOTATION: &str = "com.docker.stack.expected-generation";
/// User label keys written by the last build
pub const USER_LABELS_ANNOTATION: &str = "com.docker.stack.user-labels";

/// Labels identifying every child of a stack
pub fn for_stack_name(stack_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(STACK_NAME_LABEL.to_string(), stack_name.to_string())])
}

/// Selector labels of one service of a stack
pub fn for_service(stack_name: &str, service_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (STACK_NAME_LABEL.to_string(), stack_name.to_string()),
        (SERVICE_NAME_LABEL.to_string(), service_name.to_string()),
        (
            SERVICE_ID_LABEL.to_string(),
            format!("{stack_name}-{service_name}"),
        ),
    ])
}

/// Selects every object labelled as part of the stack
pub fn selector_for_stack(stack_name: &str) -> String {
    format!("{STACK_NAME_LABEL}={stack_name}")
}

/// Overlay user and managed labels on `meta`; managed keys win.
///
/// User keys applied by an earlier build and no longer declared are removed.
/// The applied user keys are recorded in [`USER_LABELS_ANNOTATION`]; labels
/// added by anyone else are left alone.
pub fn apply_labels(
    meta: &mut ObjectMeta,
    user: &BTreeMap<String, String>,
    managed: &BTreeMap<String, String>,
) {
    let previous: Vec<String> = meta
        .annotations
        .as_ref()
        .and_then(|a| a.get(USER_LABELS_ANNOTATION))
        .map(|keys| {
            keys.split(',')
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let mut labels = meta.labels.take().unwrap_or_default();
    for key in previous {
        if !user.contains_key(&key) {
            labels.remove(&key);
        }
    }
    labels.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
    labels.extend(managed.iter().map(|(k, v)| (k.clone(), v.clone())));
    meta.labels = Some(labels);

    let mut annotations = meta.annotations.take().unwrap_or_default();
    if user.is_empty() {
        annotations.remove(USER_LABELS_ANNOTATION);
    } else {
        let keys: Vec<&str> = user.keys().map(String::as_str).collect();
        annotations.insert(USER_LABELS_ANNOTATION.to_string(), keys.join(","));
    }
    meta.annotations = (!annotations.is_empty()).then_some(annotations);
}

/// Controller owner reference to the stack, when it has been persisted
pub fn owner_references(stack: &Stack) -> Option<Vec<OwnerReference>> {
    let uid = stack.metadata.uid.clone()?;
    Some(vec![OwnerReference {
        api_version: Stack::api_version(&()).to_string(),
        kind: Stack::kind(&()).to_string(),
        name: stack.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_labels() {
        let labels = for_service("app", "web");
        assert_eq!(labels[STACK_NAME_LABEL], "app");
        assert_eq!(labels[SERVICE_NAME_LABEL], "web");
        assert_eq!(labels[SERVICE_ID_LABEL], "app-web");
    }

    fn user(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_managed_labels_win() {
        let mut meta = ObjectMeta {
            labels: Some(user(&[("keep", "1"), (STACK_NAME_LABEL, "tampered")])),
            ..Default::default()
        };
        apply_labels(&mut meta, &user(&[(STACK_NAME_LABEL, "user")]), &for_stack_name("app"));
        let labels = meta.labels.unwrap();
        assert_eq!(labels["keep"], "1");
        assert_eq!(labels[STACK_NAME_LABEL], "app");
    }

    #[test]
    fn test_undeclared_user_labels_are_dropped() {
        let mut meta = ObjectMeta::default();
        apply_labels(&mut meta, &user(&[("tier", "web"), ("team", "a")]), &for_stack_name("app"));
        assert_eq!(meta.annotations.as_ref().unwrap()[USER_LABELS_ANNOTATION], "team,tier");

        // injected by another controller
        meta.labels
            .as_mut()
            .unwrap()
            .insert("injected".to_string(), "yes".to_string());

        apply_labels(&mut meta, &user(&[("team", "b")]), &for_stack_name("app"));
        let labels = meta.labels.as_ref().unwrap();
        assert!(!labels.contains_key("tier"));
        assert_eq!(labels["team"], "b");
        assert_eq!(labels["injected"], "yes");
        assert_eq!(meta.annotations.as_ref().unwrap()[USER_LABELS_ANNOTATION], "team");

        apply_labels(&mut meta, &BTreeMap::new(), &for_stack_name("app"));
        assert!(!meta.labels.as_ref().unwrap().contains_key("team"));
        assert!(meta.annotations.is_none());
    }

    #[test]
    fn test_owner_reference_requires_uid() {
        let mut stack = Stack::new("app", Default::default());
        assert!(owner_references(&stack).is_none());
        stack.metadata.uid = Some("uid-1".to_string());
        let refs = owner_references(&stack).unwrap();
        assert_eq!(refs[0].kind, "Stack");
        assert_eq!(refs[0].api_version, "compose.docker.com/v1alpha3");
        assert_eq!(refs[0].controller, Some(true));
    }
}
