//! Wave-sorting scenarios over realistic manifest fixtures.

use rekon_core::unstructured;
use rekon_core::{ObjMeta, ObjMetaSet};
use rekon_graph::{reverse_sort_objs, sort_objs};
use serde_json::Value;

fn obj(yaml: &str) -> Value {
    let v: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
    serde_json::to_value(v).unwrap()
}

fn names(wave: &[Value]) -> Vec<String> {
    wave.iter().map(|o| unstructured::name(o).to_string()).collect()
}

const NAMESPACE: &str = "
kind: Namespace
apiVersion: v1
metadata:
  name: test-namespace
";

const DEPLOYMENT: &str = "
kind: Deployment
apiVersion: apps/v1
metadata:
  name: foo
  namespace: test-namespace
spec:
  replicas: 1
";

const SECRET: &str = "
kind: Secret
apiVersion: v1
metadata:
  name: secret
  namespace: test-namespace
type: Opaque
";

const CRD: &str = "
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: crontabs.stable.example.com
spec:
  group: stable.example.com
  scope: Namespaced
  names:
    plural: crontabs
    kind: CronTab
";

const CRONTAB1: &str = "
apiVersion: stable.example.com/v1
kind: CronTab
metadata:
  name: cron-tab-01
  namespace: test-namespace
";

const CRONTAB2: &str = "
apiVersion: stable.example.com/v1
kind: CronTab
metadata:
  name: cron-tab-02
  namespace: test-namespace
";

const CONFIGMAP1: &str = "
apiVersion: v1
kind: ConfigMap
metadata:
  name: map1-name
  namespace: test-namespace
  annotations:
    config.kubernetes.io/depends-on: apps/namespaces/test-namespace/Deployment/foo
    config.kubernetes.io/apply-time-mutation: |
      - sourceRef:
          kind: Pod
          name: test-pod
          namespace: test-namespace
        sourcePath: .unused
        targetPath: .unused
data: {}
";

const CONFIGMAP2: &str = "
apiVersion: v1
kind: ConfigMap
metadata:
  name: map2-name
  namespace: test-namespace
  annotations:
    config.kubernetes.io/apply-time-mutation: |
      - sourceRef:
          group: apps
          kind: Deployment
          name: foo
          namespace: test-namespace
        sourcePath: .unused
        targetPath: .unused
data: {}
";

fn depends_on(yaml: &str, dep: &str) -> Value {
    let mut o = obj(yaml);
    let id = unstructured::obj_meta(&obj(dep)).unwrap();
    rekon_core::unstructured::set_annotation(
        &mut o,
        rekon_core::annotations::DEPENDS_ON_ANNOTATION,
        &rekon_core::annotations::format_depends_on_item(&id),
    );
    o
}

#[test]
fn empty_input_yields_no_waves() {
    let (waves, deps) = sort_objs(&[]).unwrap();
    assert!(waves.is_empty());
    assert!(deps.is_empty());
}

#[test]
fn unrelated_objects_share_one_wave() {
    let (waves, deps) = sort_objs(&[obj(DEPLOYMENT), obj(SECRET)]).unwrap();
    assert_eq!(waves.len(), 1);
    assert_eq!(names(&waves[0]), vec!["foo", "secret"]);
    assert_eq!(deps, vec![ObjMetaSet::new()]);
}

#[test]
fn namespace_sorts_before_its_members() {
    let (waves, _) = sort_objs(&[obj(NAMESPACE), obj(DEPLOYMENT), obj(SECRET)]).unwrap();
    assert_eq!(waves.len(), 2);
    assert_eq!(names(&waves[0]), vec!["test-namespace"]);
    let mut members = names(&waves[1]);
    members.sort();
    assert_eq!(members, vec!["foo", "secret"]);
}

#[test]
fn crd_sorts_before_custom_resources() {
    let (waves, _) = sort_objs(&[obj(CRONTAB1), obj(CRONTAB2), obj(CRD)]).unwrap();
    assert_eq!(waves.len(), 2);
    assert_eq!(names(&waves[0]), vec!["crontabs.stable.example.com"]);
    assert_eq!(names(&waves[1]), vec!["cron-tab-01", "cron-tab-02"]);
}

#[test]
fn explicit_depends_on_chain() {
    let deployment = depends_on(DEPLOYMENT, SECRET);
    let (waves, _) = sort_objs(&[deployment, obj(SECRET)]).unwrap();
    assert_eq!(waves.len(), 2);
    assert_eq!(names(&waves[0]), vec!["secret"]);
    assert_eq!(names(&waves[1]), vec!["foo"]);
}

#[test]
fn cycle_is_rejected_with_no_waves() {
    let deployment = depends_on(DEPLOYMENT, SECRET);
    let secret = depends_on(SECRET, DEPLOYMENT);
    let err = sort_objs(&[deployment, secret]).unwrap_err();
    assert!(err.to_string().contains("cyclic"), "unexpected error: {err}");
}

#[test]
fn external_dependencies_are_deduplicated_per_wave() {
    let cm1 = {
        // map1 also references the deployment externally
        let mut o = obj(CONFIGMAP1);
        let dep = ObjMeta::new("apps", "Deployment", "test-namespace", "foo").unwrap();
        rekon_core::unstructured::set_annotation(
            &mut o,
            rekon_core::annotations::DEPENDS_ON_ANNOTATION,
            &rekon_core::annotations::format_depends_on_item(&dep),
        );
        o
    };
    let (waves, deps) = sort_objs(&[cm1, obj(CONFIGMAP2)]).unwrap();
    assert_eq!(waves.len(), 2);
    // wave 0 holds only externals
    assert!(waves[0].is_empty());
    assert_eq!(names(&waves[1]), vec!["map1-name", "map2-name"]);

    let expected: ObjMetaSet = vec![
        ObjMeta::new("", "Pod", "test-namespace", "test-pod").unwrap(),
        ObjMeta::new("apps", "Deployment", "test-namespace", "foo").unwrap(),
    ]
    .into();
    assert_eq!(deps[0], expected);
    assert!(deps[1].is_empty());
}

#[test]
fn reverse_sort_flips_wave_order() {
    let (waves, _) =
        reverse_sort_objs(&[obj(CRONTAB1), obj(CRONTAB2), obj(NAMESPACE), obj(CRD)]).unwrap();
    assert_eq!(waves.len(), 2);
    assert_eq!(names(&waves[0]), vec!["cron-tab-01", "cron-tab-02"]);
    let mut leaves = names(&waves[1]);
    leaves.sort();
    assert_eq!(leaves, vec!["crontabs.stable.example.com", "test-namespace"]);
}
