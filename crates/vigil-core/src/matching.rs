//! Label selector rules.
//!
//! Constraints and actions select pods in opposite directions:
//! - a constraint applies when every pod label is listed in its selector
//!   ([`constraint_selector_contains_pod_labels`]);
//! - an action applies when every selector label is carried by the pod
//!   ([`action_selector_matches_pod_labels`]), the usual Kubernetes semantics.

use crate::model::{Action, Constraint, Labels, Selector};

fn selector_contains(selector: &Selector, key: &str, value: &str) -> bool {
    selector
        .match_labels
        .iter()
        .any(|label| label.key == key && label.value == value)
}

/// Pod labels ⊆ constraint selector. A missing or empty selector matches every pod.
pub fn constraint_selector_contains_pod_labels(
    selector: Option<&Selector>,
    pod_labels: &Labels,
) -> bool {
    match selector {
        None => true,
        Some(selector) if selector.is_empty() => true,
        Some(selector) => pod_labels
            .iter()
            .all(|(key, value)| selector_contains(selector, key, value)),
    }
}

/// Action selector ⊆ pod labels. A missing or empty selector matches every pod.
pub fn action_selector_matches_pod_labels(selector: Option<&Selector>, pod_labels: &Labels) -> bool {
    match selector {
        None => true,
        Some(selector) => selector
            .match_labels
            .iter()
            .all(|label| pod_labels.get(&label.key) == Some(&label.value)),
    }
}

pub fn constraint_matches_pod(constraint: &Constraint, namespace: &str, pod_labels: &Labels) -> bool {
    constraint.namespace == namespace
        && constraint_selector_contains_pod_labels(constraint.selector.as_ref(), pod_labels)
}

pub fn action_matches_pod(action: &Action, namespace: &str, pod_labels: &Labels) -> bool {
    action.namespace == namespace
        && action_selector_matches_pod_labels(action.selector.as_ref(), pod_labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MatchLabel;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn selector(pairs: &[(&str, &str)]) -> Selector {
        Selector {
            match_labels: pairs
                .iter()
                .map(|(k, v)| MatchLabel {
                    key: k.to_string(),
                    value: v.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn equal_label_sets_match_both_ways() {
        let s = selector(&[("app", "nginx")]);
        let pod = labels(&[("app", "nginx")]);
        assert!(constraint_selector_contains_pod_labels(Some(&s), &pod));
        assert!(action_selector_matches_pod_labels(Some(&s), &pod));
    }

    #[test]
    fn pod_with_extra_labels() {
        let s = selector(&[("app", "nginx")]);
        let pod = labels(&[("app", "nginx"), ("tier", "web")]);
        // the pod label `tier=web` is not listed in the constraint selector
        assert!(!constraint_selector_contains_pod_labels(Some(&s), &pod));
        assert!(action_selector_matches_pod_labels(Some(&s), &pod));
    }

    #[test]
    fn selector_with_extra_labels() {
        let s = selector(&[("app", "nginx"), ("tier", "web")]);
        let pod = labels(&[("app", "nginx")]);
        assert!(constraint_selector_contains_pod_labels(Some(&s), &pod));
        assert!(!action_selector_matches_pod_labels(Some(&s), &pod));
    }

    #[test]
    fn value_mismatch() {
        let s = selector(&[("app", "nginx")]);
        let pod = labels(&[("app", "redis")]);
        assert!(!constraint_selector_contains_pod_labels(Some(&s), &pod));
        assert!(!action_selector_matches_pod_labels(Some(&s), &pod));
    }

    #[test]
    fn missing_selector_matches_everything() {
        let pod = labels(&[("app", "nginx")]);
        assert!(constraint_selector_contains_pod_labels(None, &pod));
        assert!(action_selector_matches_pod_labels(None, &pod));
        assert!(constraint_selector_contains_pod_labels(
            Some(&Selector::default()),
            &pod
        ));
        assert!(action_selector_matches_pod_labels(
            Some(&Selector::default()),
            &pod
        ));
    }

    #[test]
    fn namespace_must_be_equal() {
        let mut constraint = Constraint::new("default", "c");
        constraint.selector = Some(selector(&[("app", "nginx")]));
        let mut action = Action::new("default", "a");
        action.selector = Some(selector(&[("app", "nginx")]));
        let pod = labels(&[("app", "nginx")]);

        assert!(constraint_matches_pod(&constraint, "default", &pod));
        assert!(!constraint_matches_pod(&constraint, "prod", &pod));
        assert!(action_matches_pod(&action, "default", &pod));
        assert!(!action_matches_pod(&action, "prod", &pod));
    }
}
