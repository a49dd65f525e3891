//! Object cleaning and custom transforms applied before wrapping.

use relay_core::{CustomTransform, RelayError, RelayResult};
use serde_json::Value as Json;
use tracing::warn;

const SERVER_METADATA: &[&str] = &[
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "managedFields",
    "selfLink",
    "ownerReferences",
];

const JOB_CONTROLLER_LABELS: &[&str] = &["controller-uid", "batch.kubernetes.io/controller-uid"];

/// Strip fields the source server populated so the body applies cleanly elsewhere.
pub fn clean_object(value: &Json) -> Json {
    let mut v = value.clone();
    let group_kind = {
        let api_version = v.get("apiVersion").and_then(|s| s.as_str()).unwrap_or("");
        let group = api_version.split_once('/').map(|(g, _)| g).unwrap_or("");
        (group.to_string(), v.get("kind").and_then(|s| s.as_str()).unwrap_or("").to_string())
    };
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for f in SERVER_METADATA {
            meta.remove(*f);
        }
        if meta.get("name").and_then(|n| n.as_str()).is_some_and(|n| !n.is_empty()) {
            meta.remove("generateName");
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    match (group_kind.0.as_str(), group_kind.1.as_str()) {
        ("", "Service") => clean_service(&mut v),
        ("batch", "Job") => clean_job(&mut v),
        _ => {}
    }
    v
}

// Allocated IPs are cluster-local; headless services keep "None".
fn clean_service(v: &mut Json) {
    let Some(spec) = v.get_mut("spec").and_then(|s| s.as_object_mut()) else { return };
    let headless = spec.get("clusterIP").and_then(|s| s.as_str()) == Some("None");
    if !headless {
        spec.remove("clusterIP");
        spec.remove("clusterIPs");
    }
}

fn clean_job(v: &mut Json) {
    let manual = v.pointer("/spec/manualSelector").and_then(|b| b.as_bool()).unwrap_or(false);
    if manual {
        return;
    }
    if let Some(spec) = v.get_mut("spec").and_then(|s| s.as_object_mut()) {
        spec.remove("selector");
    }
    for ptr in ["/metadata/labels", "/spec/template/metadata/labels"] {
        if let Some(labels) = v.pointer_mut(ptr).and_then(|l| l.as_object_mut()) {
            for l in JOB_CONTROLLER_LABELS {
                labels.remove(*l);
            }
        }
    }
}

/// Parse `$.a.b` / `$.a["k.with.dots"]` into path segments.
pub fn parse_path(path: &str) -> RelayResult<Vec<String>> {
    let bad = |why: &str| RelayError::Malformed(format!("path {:?}: {}", path, why));
    let rest = path.strip_prefix('$').ok_or_else(|| bad("must start with $"))?;
    let mut segs = Vec::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut seg = String::new();
                while let Some(&n) = chars.peek() {
                    if n == '.' || n == '[' {
                        break;
                    }
                    seg.push(n);
                    chars.next();
                }
                if seg.is_empty() {
                    return Err(bad("empty segment"));
                }
                segs.push(seg);
            }
            '[' => {
                if chars.next() != Some('"') {
                    return Err(bad("expected '\"' after '['"));
                }
                let mut seg = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(n) => seg.push(n),
                        None => return Err(bad("unterminated key")),
                    }
                }
                if chars.next() != Some(']') {
                    return Err(bad("expected ']'"));
                }
                segs.push(seg);
            }
            other => return Err(bad(&format!("unexpected {:?}", other))),
        }
    }
    if segs.is_empty() {
        return Err(bad("refers to the whole object"));
    }
    Ok(segs)
}

fn remove_at(v: &mut Json, segs: &[String]) -> bool {
    let Some((last, parents)) = segs.split_last() else { return false };
    let mut cur = v;
    for s in parents {
        match cur.get_mut(s.as_str()) {
            Some(next) => cur = next,
            None => return false,
        }
    }
    cur.as_object_mut().map(|o| o.remove(last).is_some()).unwrap_or(false)
}

/// Apply every removal; returns how many fields were removed. Bad paths are skipped.
pub fn apply_transforms<'a>(value: &mut Json, transforms: impl IntoIterator<Item = &'a CustomTransform>) -> usize {
    let mut removed = 0;
    for t in transforms {
        for path in &t.remove {
            match parse_path(path) {
                Ok(segs) => removed += usize::from(remove_at(value, &segs)),
                Err(e) => warn!(transform = %t.name, error = %e, "skipping removal"),
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_server_fields_and_status() {
        let v = json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {
                "name": "nginx", "generateName": "nginx-", "namespace": "web",
                "uid": "u", "resourceVersion": "9", "generation": 3, "creationTimestamp": "t",
                "managedFields": [], "selfLink": "/x", "ownerReferences": [],
                "labels": {"app": "nginx"}
            },
            "spec": {"replicas": 2},
            "status": {"readyReplicas": 2}
        });
        let c = clean_object(&v);
        let meta = c["metadata"].as_object().unwrap();
        assert_eq!(meta.keys().collect::<Vec<_>>(), vec!["labels", "name", "namespace"]);
        assert!(c.get("status").is_none());
        assert_eq!(c["spec"]["replicas"], 2);
    }

    #[test]
    fn generate_name_survives_without_name() {
        let v = json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"generateName": "p-"}});
        assert_eq!(clean_object(&v)["metadata"]["generateName"], "p-");
    }

    #[test]
    fn service_ips_are_dropped_unless_headless() {
        let svc = json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"},
            "spec": {"clusterIP": "10.0.0.1", "clusterIPs": ["10.0.0.1"], "ports": [{"port": 80}]}});
        let c = clean_object(&svc);
        assert!(c["spec"].get("clusterIP").is_none());
        assert!(c["spec"].get("clusterIPs").is_none());
        let headless = json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "h"}, "spec": {"clusterIP": "None"}});
        assert_eq!(clean_object(&headless)["spec"]["clusterIP"], "None");
    }

    #[test]
    fn job_selector_and_controller_labels_are_dropped() {
        let job = json!({"apiVersion": "batch/v1", "kind": "Job", "metadata": {"name": "j", "labels": {"controller-uid": "u", "app": "j"}},
            "spec": {"selector": {"matchLabels": {"controller-uid": "u"}},
                     "template": {"metadata": {"labels": {"batch.kubernetes.io/controller-uid": "u", "app": "j"}}}}});
        let c = clean_object(&job);
        assert!(c["spec"].get("selector").is_none());
        assert_eq!(c["metadata"]["labels"], json!({"app": "j"}));
        assert_eq!(c["spec"]["template"]["metadata"]["labels"], json!({"app": "j"}));
    }

    #[test]
    fn paths_parse_dots_and_brackets() {
        assert_eq!(parse_path("$.spec.replicas").unwrap(), vec!["spec", "replicas"]);
        assert_eq!(
            parse_path("$.metadata.annotations[\"example.com/x\"]").unwrap(),
            vec!["metadata", "annotations", "example.com/x"]
        );
        assert!(parse_path("spec").is_err());
        assert!(parse_path("$").is_err());
        assert!(parse_path("$..a").is_err());
        assert!(parse_path("$.a[\"b").is_err());
    }

    #[test]
    fn transforms_remove_fields_and_skip_bad_paths() {
        let t = CustomTransform {
            name: "t".into(),
            api_group: "apps".into(),
            resource: "deployments".into(),
            remove: vec!["$.spec.replicas".into(), "bogus".into(), "$.spec.missing.deep".into(), "$.metadata.annotations[\"a.b/c\"]".into()],
        };
        let mut v = json!({"metadata": {"annotations": {"a.b/c": "1", "keep": "2"}}, "spec": {"replicas": 3, "paused": false}});
        assert_eq!(apply_transforms(&mut v, [&t]), 2);
        assert_eq!(v, json!({"metadata": {"annotations": {"keep": "2"}}, "spec": {"paused": false}}));
    }
}
