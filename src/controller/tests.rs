use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestStatus,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, Node, NodeAddress, NodeCondition, NodeStatus, Service, ServiceSpec,
};
use kube::api::ObjectMeta;
use mockall::predicate::eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::cluster::{ClusterOperatorRecord, MockClusterApi};
use crate::inventory::MockInventoryClient;
use crate::models::{
    Cluster, ClusterKind, Host, HostProgress, OperatorCondition, OperatorType,
};
use crate::ops::MockHostOps;

type ProgressLog = Arc<Mutex<Vec<(String, HostStage)>>>;
type CompletionLog = Arc<Mutex<Option<(bool, Option<String>)>>>;

fn test_config() -> ControllerConfig {
    ControllerConfig {
        cluster_id: "cluster-id".into(),
        url: "https://assisted-service.com:80".into(),
        namespace: "assisted-installer".into(),
        openshift_version: "4.10.0".into(),
        wait_for_cluster_version: false,
        must_gather_image: String::new(),
        pull_secret_token: String::new(),
        ca_cert_path: None,
        skip_cert_verification: false,
        dry_run: false,
    }
}

fn controller(
    config: ControllerConfig,
    inventory: MockInventoryClient,
    ops: MockHostOps,
    cluster: MockClusterApi,
) -> Controller {
    Controller::new(config, Arc::new(inventory), Arc::new(ops), Arc::new(cluster))
        .with_intervals(
            Duration::from_millis(1),
            Duration::from_millis(1),
            Duration::from_millis(1),
        )
        .with_timeouts(Duration::from_millis(250), Duration::from_millis(250))
}

fn host_at(name: &str, id: &str, status: HostStatus, stage: Option<HostStage>) -> (String, Host) {
    (
        name.to_string(),
        Host {
            id: id.into(),
            infra_env_id: "infra-env-id".into(),
            status,
            progress: HostProgress {
                current_stage: stage,
                progress_info: String::new(),
            },
            requested_hostname: name.into(),
            inventory: String::new(),
            node_labels: String::new(),
        },
    )
}

fn three_hosts(status: HostStatus, stage: HostStage) -> HostsByName {
    HashMap::from([
        host_at("node0", "h0", status, Some(stage)),
        host_at("node1", "h1", status, Some(stage)),
        host_at("node2", "h2", status, Some(stage)),
    ])
}

fn node(name: &str, ready: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".into(),
                status: if ready { "True" } else { "False" }.into(),
                ..Default::default()
            }]),
            addresses: Some(vec![NodeAddress {
                type_: "InternalIP".into(),
                address: format!("10.0.0.{}", name.len()),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn three_nodes(ready: bool) -> Vec<Node> {
    vec![node("node0", ready), node("node1", ready), node("node2", ready)]
}

fn recording_inventory(log: &ProgressLog) -> MockInventoryClient {
    let mut inventory = MockInventoryClient::new();
    let log = log.clone();
    inventory
        .expect_update_host_install_progress()
        .returning(move |_, host_id, stage, _| {
            log.lock().unwrap().push((host_id.to_string(), stage));
            Ok(())
        });
    inventory
}

fn monitored(name: &str, status: Option<OperatorStatus>, info: &str) -> MonitoredOperator {
    MonitoredOperator {
        name: name.into(),
        namespace: "openshift-local-storage".into(),
        subscription_name: format!("{}-subscription", name),
        operator_type: if name == CONSOLE_OPERATOR_NAME || name == CVO_OPERATOR_NAME {
            OperatorType::Builtin
        } else {
            OperatorType::Olm
        },
        status,
        status_info: info.into(),
        timeout_seconds: 0,
    }
}

fn service(name: &str, namespace: &str, cluster_ip: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some(cluster_ip.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn csr(name: &str, decided: bool) -> CertificateSigningRequest {
    CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: decided.then(|| CertificateSigningRequestStatus {
            conditions: Some(vec![CertificateSigningRequestCondition {
                type_: "Approved".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn bmh(name: &str, consumer: Option<&str>) -> DynamicObject {
    let mut spec = json!({});
    if let Some(consumer) = consumer {
        spec = json!({"consumerRef": {"kind": "Machine", "name": consumer}});
    }
    DynamicObject {
        types: None,
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("openshift-machine-api".to_string()),
            ..Default::default()
        },
        data: json!({
            "spec": spec,
            "status": {"provisioning": {"state": "externally provisioned"}},
        }),
    }
}

fn worker_machine(name: &str) -> DynamicObject {
    DynamicObject {
        types: None,
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("openshift-machine-api".to_string()),
            labels: Some(BTreeMap::from([(
                MACHINE_ROLE_LABEL.to_string(),
                "worker".to_string(),
            )])),
            ..Default::default()
        },
        data: json!({"spec": {}}),
    }
}

// =========================================================================
// set_ready_state
// =========================================================================

#[tokio::test]
async fn ready_state_retries_each_dependency_until_it_succeeds() {
    let mut inventory = MockInventoryClient::new();
    inventory
        .expect_get_cluster()
        .times(1)
        .returning(|| Err(Error::inventory("dummy")));
    inventory.expect_get_cluster().times(3).returning(|| {
        Ok(Cluster {
            id: "cluster-id".into(),
            status: ClusterStatus::Installing,
            kind: ClusterKind::Cluster,
        })
    });

    let mut cluster = MockClusterApi::new();
    cluster
        .expect_list_nodes()
        .times(1)
        .returning(|| Err(Error::validation("dummy")));
    cluster.expect_list_nodes().times(2).returning(|| Ok(vec![]));
    cluster
        .expect_create_event()
        .times(1)
        .returning(|_, _, _, _| Err(Error::validation("dummy")));
    cluster
        .expect_create_event()
        .with(
            eq("assisted-installer"),
            eq(CONTROLLER_READY_EVENT),
            mockall::predicate::always(),
            mockall::predicate::always(),
        )
        .times(1)
        .returning(|_, _, _, _| Ok(()));

    let controller = controller(test_config(), inventory, MockHostOps::new(), cluster);
    controller.set_ready_state().await;
    assert!(!controller.status.has_error());
}

// =========================================================================
// wait_and_update_nodes_status
// =========================================================================

#[tokio::test]
async fn nodes_status_reports_joined_and_done_for_ready_nodes() {
    let log: ProgressLog = Arc::new(Mutex::new(Vec::new()));
    let mut inventory = recording_inventory(&log);
    inventory
        .expect_get_hosts()
        .returning(|_| Ok(three_hosts(HostStatus::Installing, HostStage::Configuring)));

    let mut cluster = MockClusterApi::new();
    cluster
        .expect_list_nodes()
        .returning(|| Ok(three_nodes(true)));

    let controller = controller(test_config(), inventory, MockHostOps::new(), cluster);
    let exit = controller.wait_and_update_nodes_status().await;
    assert!(!exit);

    let log = log.lock().unwrap();
    for host_id in ["h0", "h1", "h2"] {
        let stages: Vec<HostStage> = log
            .iter()
            .filter(|(id, _)| id == host_id)
            .map(|(_, stage)| *stage)
            .collect();
        assert_eq!(stages, vec![HostStage::Joined, HostStage::Done]);
    }
}

#[tokio::test]
async fn nodes_status_reports_only_joined_for_unready_nodes() {
    let log: ProgressLog = Arc::new(Mutex::new(Vec::new()));
    let mut inventory = recording_inventory(&log);
    inventory
        .expect_get_hosts()
        .returning(|_| Ok(three_hosts(HostStatus::Installing, HostStage::Configuring)));

    let mut cluster = MockClusterApi::new();
    cluster
        .expect_list_nodes()
        .returning(|| Ok(three_nodes(false)));

    let controller = controller(test_config(), inventory, MockHostOps::new(), cluster);
    let exit = controller.wait_and_update_nodes_status().await;
    assert!(!exit);

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|(_, stage)| *stage == HostStage::Joined));
}

#[tokio::test]
async fn nodes_status_exits_when_all_hosts_are_installed() {
    let mut inventory = MockInventoryClient::new();
    inventory
        .expect_get_hosts()
        .times(1)
        .returning(|_| Ok(three_hosts(HostStatus::Installed, HostStage::Done)));

    // no node listing once every host is terminal
    let controller = controller(
        test_config(),
        inventory,
        MockHostOps::new(),
        MockClusterApi::new(),
    );
    assert!(controller.wait_and_update_nodes_status().await);
}

#[tokio::test]
async fn nodes_status_exits_when_all_hosts_errored() {
    let mut inventory = MockInventoryClient::new();
    inventory
        .expect_get_hosts()
        .times(1)
        .returning(|_| Ok(three_hosts(HostStatus::Error, HostStage::Joined)));

    let controller = controller(
        test_config(),
        inventory,
        MockHostOps::new(),
        MockClusterApi::new(),
    );
    assert!(controller.wait_and_update_nodes_status().await);
}

#[tokio::test]
async fn nodes_status_tolerates_inventory_failure() {
    let mut inventory = MockInventoryClient::new();
    inventory
        .expect_get_hosts()
        .times(1)
        .returning(|_| Err(Error::inventory("dummy")));

    let controller = controller(
        test_config(),
        inventory,
        MockHostOps::new(),
        MockClusterApi::new(),
    );
    assert!(!controller.wait_and_update_nodes_status().await);
}

// =========================================================================
// CSR approval
// =========================================================================

#[tokio::test]
async fn csr_approval_skips_decided_requests() {
    let mut cluster = MockClusterApi::new();
    cluster
        .expect_list_csrs()
        .returning(|| Ok(vec![csr("decided", true), csr("pending", false)]));
    cluster
        .expect_approve_csr()
        .withf(|csr| csr.metadata.name.as_deref() == Some("pending"))
        .times(1)
        .returning(|_| Ok(()));

    let controller = controller(
        test_config(),
        MockInventoryClient::new(),
        MockHostOps::new(),
        cluster,
    );
    controller.approve_pending_csrs().await;
    // a second pass over the same decided CSR approves nothing new
}

#[tokio::test]
async fn csr_approval_errors_are_not_fatal() {
    let mut cluster = MockClusterApi::new();
    cluster
        .expect_list_csrs()
        .returning(|| Ok(vec![csr("pending", false)]));
    cluster
        .expect_approve_csr()
        .returning(|_| Err(Error::validation("conflict")));

    let controller = controller(
        test_config(),
        MockInventoryClient::new(),
        MockHostOps::new(),
        cluster,
    );
    controller.approve_pending_csrs().await;
    assert!(!controller.status.has_error());
}

// =========================================================================
// DNS address conflict
// =========================================================================

#[test]
fn dns_service_ip_math() {
    assert_eq!(dns_service_ip("10.56.20.0/24").unwrap(), "10.56.20.10");
    assert_eq!(dns_service_ip("172.30.0.0/16").unwrap(), "172.30.0.10");
    assert_eq!(dns_service_ip("2001:db8::/112").unwrap(), "2001:db8::a");
    assert!(dns_service_ip("not-a-network").is_err());
}

#[tokio::test]
async fn dns_conflict_deletes_squatter_then_bounces_operator_pods() {
    let mut cluster = MockClusterApi::new();
    cluster
        .expect_get_service_networks()
        .returning(|| Ok(vec!["10.56.20.0/24".to_string()]));
    cluster
        .expect_list_services()
        .times(1)
        .returning(|_| Ok(vec![service("conflict", "testing", "10.56.20.10")]));
    cluster
        .expect_delete_service()
        .with(eq("testing"), eq("conflict"))
        .times(1)
        .returning(|_, _| Ok(()));
    cluster
        .expect_delete_pods()
        .with(eq(DNS_OPERATOR_NAMESPACE))
        .times(1)
        .returning(|_| Ok(()));
    cluster
        .expect_list_services()
        .returning(|_| Ok(vec![service(DNS_SERVICE_NAME, "openshift-dns", "10.56.20.10")]));

    let controller = controller(
        test_config(),
        MockInventoryClient::new(),
        MockHostOps::new(),
        cluster,
    );
    controller
        .hack_dns_address_conflict(CancellationToken::new())
        .await;
}

#[tokio::test]
async fn dns_conflict_is_idempotent_on_a_healthy_cluster() {
    let mut cluster = MockClusterApi::new();
    cluster
        .expect_get_service_networks()
        .returning(|| Ok(vec!["10.56.20.0/24".to_string()]));
    cluster
        .expect_list_services()
        .returning(|_| Ok(vec![service(DNS_SERVICE_NAME, "openshift-dns", "10.56.20.10")]));
    // no deletions on a healthy cluster; any delete call fails the test

    let controller = controller(
        test_config(),
        MockInventoryClient::new(),
        MockHostOps::new(),
        cluster,
    );
    controller
        .hack_dns_address_conflict(CancellationToken::new())
        .await;
}

#[tokio::test]
async fn dns_conflict_gives_up_when_service_networks_unavailable() {
    let mut cluster = MockClusterApi::new();
    cluster
        .expect_get_service_networks()
        .times(1)
        .returning(|| Err(Error::validation("no network config")));

    let controller = controller(
        test_config(),
        MockInventoryClient::new(),
        MockHostOps::new(),
        cluster,
    );
    controller
        .hack_dns_address_conflict(CancellationToken::new())
        .await;
}

#[tokio::test]
async fn dns_conflict_exhausts_its_attempt_budget() {
    let mut cluster = MockClusterApi::new();
    cluster
        .expect_get_service_networks()
        .returning(|| Ok(vec!["10.56.20.0/24".to_string()]));
    cluster
        .expect_list_services()
        .times(3)
        .returning(|_| Err(Error::validation("api down")));

    let controller = controller(
        test_config(),
        MockInventoryClient::new(),
        MockHostOps::new(),
        cluster,
    )
    .with_dns_attempts(3);
    controller
        .hack_dns_address_conflict(CancellationToken::new())
        .await;
}

// =========================================================================
// operator availability pipeline
// =========================================================================

#[tokio::test]
async fn console_progress_updates_are_sent_only_on_change() {
    let mut inventory = MockInventoryClient::new();
    // first poll: the service still has no status for the operator
    inventory
        .expect_get_cluster_monitored_operator()
        .with(eq(CONSOLE_OPERATOR_NAME))
        .times(1)
        .returning(|_| Ok(monitored(CONSOLE_OPERATOR_NAME, Some(OperatorStatus::Progressing), "")));
    // after the update the service mirrors the reported message
    inventory
        .expect_get_cluster_monitored_operator()
        .with(eq(CONSOLE_OPERATOR_NAME))
        .times(1)
        .returning(|_| {
            Ok(monitored(
                CONSOLE_OPERATOR_NAME,
                Some(OperatorStatus::Progressing),
                "console is rolling out",
            ))
        });
    // finally the operator converges
    inventory
        .expect_get_cluster_monitored_operator()
        .with(eq(CONSOLE_OPERATOR_NAME))
        .returning(|_| Ok(monitored(CONSOLE_OPERATOR_NAME, Some(OperatorStatus::Available), "done")));
    inventory
        .expect_update_cluster_operator()
        .with(
            eq(CONSOLE_OPERATOR_NAME),
            eq(OperatorStatus::Progressing),
            eq("console is rolling out"),
        )
        .times(1)
        .returning(|_, _, _| Ok(()));

    let mut cluster = MockClusterApi::new();
    cluster.expect_get_cluster_operator().times(2).returning(|_| {
        Ok(ClusterOperatorRecord {
            name: CONSOLE_OPERATOR_NAME.into(),
            conditions: vec![OperatorCondition {
                condition_type: "Progressing".into(),
                status: "True".into(),
                message: "console is rolling out".into(),
            }],
        })
    });

    let controller = controller(test_config(), inventory, MockHostOps::new(), cluster);
    controller
        .waiting_for_cluster_operators(&CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn cvo_deadline_exceeded_fails_the_wait() {
    let mut config = test_config();
    config.wait_for_cluster_version = true;

    let mut inventory = MockInventoryClient::new();
    inventory
        .expect_get_cluster_monitored_operator()
        .with(eq(CONSOLE_OPERATOR_NAME))
        .returning(|_| Ok(monitored(CONSOLE_OPERATOR_NAME, Some(OperatorStatus::Available), "done")));
    inventory
        .expect_get_cluster_monitored_operator()
        .with(eq(CVO_OPERATOR_NAME))
        .times(1)
        .returning(|_| Ok(monitored(CVO_OPERATOR_NAME, Some(OperatorStatus::Progressing), "")));
    inventory
        .expect_get_cluster_monitored_operator()
        .with(eq(CVO_OPERATOR_NAME))
        .returning(|_| Ok(monitored(CVO_OPERATOR_NAME, Some(OperatorStatus::Progressing), "progress")));
    inventory
        .expect_update_cluster_operator()
        .with(eq(CVO_OPERATOR_NAME), eq(OperatorStatus::Progressing), eq("progress"))
        .times(1)
        .returning(|_, _, _| Ok(()));

    let mut cluster = MockClusterApi::new();
    cluster.expect_get_cluster_version().returning(|| {
        Ok(ClusterOperatorRecord {
            name: "version".into(),
            conditions: vec![OperatorCondition {
                condition_type: "Progressing".into(),
                status: "True".into(),
                message: "progress".into(),
            }],
        })
    });

    let controller = controller(config, inventory, MockHostOps::new(), cluster);
    let err = controller
        .waiting_for_cluster_operators(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cvo"));
}

#[tokio::test]
async fn olm_operator_timeout_marks_failed_but_completes_successfully() {
    let completion: CompletionLog = Arc::new(Mutex::new(None));

    let mut inventory = MockInventoryClient::new();
    inventory.expect_get_cluster().times(1).returning(|| {
        Ok(Cluster {
            id: "cluster-id".into(),
            status: ClusterStatus::Finalizing,
            kind: ClusterKind::Cluster,
        })
    });
    inventory
        .expect_get_cluster_monitored_operator()
        .with(eq(CONSOLE_OPERATOR_NAME))
        .returning(|_| Ok(monitored(CONSOLE_OPERATOR_NAME, Some(OperatorStatus::Available), "done")));
    inventory
        .expect_get_cluster_monitored_olm_operators()
        .returning(|| Ok(vec![monitored("lso", Some(OperatorStatus::Progressing), "")]));
    inventory
        .expect_download_file()
        .with(eq(CUSTOM_MANIFESTS_FILE), mockall::predicate::always())
        .times(1)
        .returning(|_, dest| {
            std::fs::write(dest, b"[]")?;
            Ok(())
        });
    inventory
        .expect_download_cluster_credentials()
        .with(eq(KUBECONFIG_FILE_NAME), mockall::predicate::always())
        .times(1)
        .returning(|_, _| Ok(()));
    // the timed-out operator is reported failed exactly once
    inventory
        .expect_update_cluster_operator()
        .with(eq("lso"), eq(OperatorStatus::Failed), eq(OPERATOR_TIMED_OUT_MESSAGE))
        .times(1)
        .returning(|_, _, _| Ok(()));
    inventory
        .expect_get_hosts()
        .returning(|_| Ok(HashMap::new()));
    inventory
        .expect_upload_ingress_ca()
        .with(eq("CA"))
        .times(1)
        .returning(|_| Ok(()));
    let completion_log = completion.clone();
    inventory
        .expect_complete_installation()
        .times(1)
        .returning(move |success, error_info| {
            *completion_log.lock().unwrap() = Some((success, error_info));
            Ok(())
        });

    let mut cluster = MockClusterApi::new();
    cluster.expect_get_config_map().returning(|_, _| {
        Ok(ConfigMap {
            data: Some(BTreeMap::from([(
                "ca-bundle.crt".to_string(),
                "CA".to_string(),
            )])),
            ..Default::default()
        })
    });

    let controller = controller(test_config(), inventory, MockHostOps::new(), cluster);
    controller
        .post_install_configs(&CancellationToken::new())
        .await;

    assert!(!controller.status.has_error());
    assert!(controller.status.has_operator_error());
    assert_eq!(controller.status.get_operators_in_error(), vec!["lso"]);
    let completion = completion.lock().unwrap().clone().unwrap();
    assert_eq!(completion, (true, None));
}

#[tokio::test]
async fn cvo_timeout_posts_completion_with_failure() {
    let completion: CompletionLog = Arc::new(Mutex::new(None));

    let mut config = test_config();
    config.wait_for_cluster_version = true;

    let mut inventory = MockInventoryClient::new();
    inventory.expect_get_cluster().times(1).returning(|| {
        Ok(Cluster {
            id: "cluster-id".into(),
            status: ClusterStatus::Finalizing,
            kind: ClusterKind::Cluster,
        })
    });
    inventory
        .expect_get_cluster_monitored_operator()
        .with(eq(CONSOLE_OPERATOR_NAME))
        .returning(|_| Ok(monitored(CONSOLE_OPERATOR_NAME, Some(OperatorStatus::Available), "done")));
    inventory
        .expect_get_cluster_monitored_operator()
        .with(eq(CVO_OPERATOR_NAME))
        .returning(|_| Ok(monitored(CVO_OPERATOR_NAME, Some(OperatorStatus::Progressing), "progress")));
    inventory
        .expect_get_cluster_monitored_olm_operators()
        .returning(|| Ok(vec![]));
    inventory
        .expect_download_file()
        .returning(|_, dest| {
            std::fs::write(dest, b"[]")?;
            Ok(())
        });
    inventory
        .expect_download_cluster_credentials()
        .returning(|_, _| Ok(()));
    inventory
        .expect_upload_ingress_ca()
        .returning(|_| Ok(()));
    inventory
        .expect_get_hosts()
        .returning(|_| Ok(HashMap::new()));
    let completion_log = completion.clone();
    inventory
        .expect_complete_installation()
        .times(1)
        .returning(move |success, error_info| {
            *completion_log.lock().unwrap() = Some((success, error_info));
            Ok(())
        });

    let mut cluster = MockClusterApi::new();
    cluster.expect_get_cluster_version().returning(|| {
        Ok(ClusterOperatorRecord {
            name: "version".into(),
            conditions: vec![OperatorCondition {
                condition_type: "Progressing".into(),
                status: "True".into(),
                message: "progress".into(),
            }],
        })
    });
    cluster.expect_get_config_map().returning(|_, _| {
        Ok(ConfigMap {
            data: Some(BTreeMap::from([(
                "ca-bundle.crt".to_string(),
                "CA".to_string(),
            )])),
            ..Default::default()
        })
    });

    let controller = controller(config, inventory, MockHostOps::new(), cluster);
    controller
        .post_install_configs(&CancellationToken::new())
        .await;

    assert!(controller.status.has_error());
    let (success, error_info) = completion.lock().unwrap().clone().unwrap();
    assert!(!success);
    assert!(error_info.unwrap().contains("cvo"));
}

// =========================================================================
// OLM timeout budget
// =========================================================================

#[test]
fn olm_timeout_defaults_to_the_general_budget() {
    let controller = controller(
        test_config(),
        MockInventoryClient::new(),
        MockHostOps::new(),
        MockClusterApi::new(),
    )
    .with_timeouts(Duration::from_secs(70 * 60), Duration::from_secs(3 * 3600));

    assert_eq!(
        controller.maximum_olm_timeout(&[]),
        Duration::from_secs(70 * 60)
    );

    let mut lower = monitored("lso", None, "");
    lower.timeout_seconds = 60;
    assert_eq!(
        controller.maximum_olm_timeout(&[lower]),
        Duration::from_secs(70 * 60)
    );
}

#[test]
fn olm_timeout_takes_the_largest_operator_budget() {
    let controller = controller(
        test_config(),
        MockInventoryClient::new(),
        MockHostOps::new(),
        MockClusterApi::new(),
    )
    .with_timeouts(Duration::from_secs(70 * 60), Duration::from_secs(3 * 3600));

    let mut cnv = monitored("cnv", None, "");
    cnv.timeout_seconds = 120 * 60;
    let mut lso = monitored("lso", None, "");
    lso.timeout_seconds = 130 * 60;
    assert_eq!(
        controller.maximum_olm_timeout(&[cnv, lso]),
        Duration::from_secs(130 * 60)
    );
}

// =========================================================================
// must-gather image selection
// =========================================================================

#[test]
fn must_gather_empty_image_yields_nothing() {
    let controller = controller(
        test_config(),
        MockInventoryClient::new(),
        MockHostOps::new(),
        MockClusterApi::new(),
    );
    assert!(controller.parse_must_gather_images().is_empty());
}

#[test]
fn must_gather_plain_string_is_a_single_image() {
    let mut config = test_config();
    config.must_gather_image = "quay.io/test-must-gather:latest".into();
    let controller = controller(
        config,
        MockInventoryClient::new(),
        MockHostOps::new(),
        MockClusterApi::new(),
    );
    assert_eq!(
        controller.parse_must_gather_images(),
        vec!["quay.io/test-must-gather:latest"]
    );
}

#[test]
fn must_gather_json_map_includes_ocp_and_errored_operators() {
    let mut config = test_config();
    config.must_gather_image =
        r#"{"ocp": "quay.io/openshift/must-gather", "lso": "blah", "cnv": "unused"}"#.into();
    let controller = controller(
        config,
        MockInventoryClient::new(),
        MockHostOps::new(),
        MockClusterApi::new(),
    );
    controller.status.operator_error("lso");

    let mut images = controller.parse_must_gather_images();
    images.sort();
    assert_eq!(images, vec!["blah", "quay.io/openshift/must-gather"]);
}

// =========================================================================
// log upload
// =========================================================================

#[tokio::test]
async fn summary_logs_bundle_operators_and_pod_logs() {
    let mut cluster = MockClusterApi::new();
    cluster.expect_list_cluster_operators().returning(|| {
        Ok(vec![ClusterOperatorRecord {
            name: "console".into(),
            conditions: vec![],
        }])
    });
    cluster
        .expect_get_pod_logs()
        .with(eq("assisted-installer"), eq("controller-pod"), eq(CONTROLLER_LOGS_SECONDS_AGO))
        .times(1)
        .returning(|_, _, _| Ok("log line".to_string()));

    let mut inventory = MockInventoryClient::new();
    inventory
        .expect_upload_logs()
        .withf(|logs_type, _| *logs_type == LogsType::Controller)
        .times(1)
        .returning(|_, _| Ok(()));

    let controller = controller(test_config(), inventory, MockHostOps::new(), cluster);
    controller
        .upload_summary_logs("controller-pod", "assisted-installer", CONTROLLER_LOGS_SECONDS_AGO)
        .await
        .unwrap();
}

#[tokio::test]
async fn summary_logs_surface_upload_failures() {
    let mut cluster = MockClusterApi::new();
    cluster
        .expect_list_cluster_operators()
        .returning(|| Ok(vec![]));
    cluster
        .expect_get_pod_logs()
        .returning(|_, _, _| Ok("log line".to_string()));

    let mut inventory = MockInventoryClient::new();
    inventory
        .expect_upload_logs()
        .returning(|_, _| Err(Error::inventory("dummy")));

    let controller = controller(test_config(), inventory, MockHostOps::new(), cluster);
    let result = controller
        .upload_summary_logs("controller-pod", "assisted-installer", CONTROLLER_LOGS_SECONDS_AGO)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn must_gather_is_retried_while_the_cluster_is_in_error() {
    let archive_dir = tempfile::tempdir().unwrap();
    let archive = archive_dir.path().join("must-gather.tar.gz");
    std::fs::write(&archive, b"tarball").unwrap();

    let mut config = test_config();
    config.must_gather_image = "quay.io/test-must-gather:latest".into();

    let mut cluster = MockClusterApi::new();
    cluster
        .expect_list_cluster_operators()
        .returning(|| Ok(vec![]));
    cluster
        .expect_get_pod_logs()
        .returning(|_, _, _| Ok("log line".to_string()));

    let mut inventory = MockInventoryClient::new();
    inventory
        .expect_download_cluster_credentials()
        .returning(|_, dest| {
            std::fs::write(dest, b"kubeconfig")?;
            Ok(())
        });
    inventory.expect_upload_logs().returning(|_, _| Ok(()));

    let mut ops = MockHostOps::new();
    ops.expect_get_must_gather_logs()
        .times(1)
        .returning(|_, _, _| Err(Error::ops("image pull failed")));
    let archive_path = archive.clone();
    ops.expect_get_must_gather_logs()
        .times(1)
        .returning(move |_, _, _| Ok(archive_path.clone()));

    let controller = controller(config, inventory, ops, cluster);
    controller.status.error("cluster failed");
    controller
        .upload_summary_logs("controller-pod", "assisted-installer", CONTROLLER_LOGS_SECONDS_AGO)
        .await
        .unwrap();
}

// =========================================================================
// BMH reconciliation
// =========================================================================

#[tokio::test]
async fn bmh_with_metal3_provisioning_is_paused_and_externally_provisioned() {
    let updated: Arc<Mutex<Option<DynamicObject>>> = Arc::new(Mutex::new(None));

    let mut cluster = MockClusterApi::new();
    cluster
        .expect_list_bmhs()
        .returning(|| Ok(vec![bmh("bmh-master-0", None)]));
    cluster
        .expect_list_machines()
        .returning(|_| Ok(vec![worker_machine("worker-0")]));
    cluster
        .expect_is_metal_provisioning_exists()
        .returning(|| Ok(true));
    cluster.expect_update_bmh_status().returning(|_| Ok(()));
    let captured = updated.clone();
    cluster.expect_update_bmh().times(1).returning(move |bmh| {
        *captured.lock().unwrap() = Some(bmh.clone());
        Ok(())
    });

    let controller = controller(
        test_config(),
        MockInventoryClient::new(),
        MockHostOps::new(),
        cluster,
    );
    assert!(controller.update_bmhs_once().await);

    let bmh = updated.lock().unwrap().clone().unwrap();
    let annotations = bmh.metadata.annotations.unwrap();
    assert!(annotations.contains_key(BMH_PAUSED_ANNOTATION));
    assert!(annotations.contains_key(BMH_STATUS_ANNOTATION));
    assert_eq!(
        bmh.data.pointer("/spec/externallyProvisioned"),
        Some(&serde_json::Value::Bool(true))
    );
}

#[tokio::test]
async fn bmh_without_provisioning_is_bound_to_a_worker_machine() {
    let updated: Arc<Mutex<Option<DynamicObject>>> = Arc::new(Mutex::new(None));

    let mut cluster = MockClusterApi::new();
    cluster
        .expect_list_bmhs()
        .returning(|| Ok(vec![bmh("bmh-worker-0", None)]));
    cluster
        .expect_list_machines()
        .returning(|_| Ok(vec![worker_machine("worker-0")]));
    cluster
        .expect_is_metal_provisioning_exists()
        .returning(|| Ok(false));
    cluster.expect_update_bmh_status().returning(|_| Ok(()));
    let captured = updated.clone();
    cluster.expect_update_bmh().times(1).returning(move |bmh| {
        *captured.lock().unwrap() = Some(bmh.clone());
        Ok(())
    });

    let controller = controller(
        test_config(),
        MockInventoryClient::new(),
        MockHostOps::new(),
        cluster,
    );
    assert!(controller.update_bmhs_once().await);

    let bmh = updated.lock().unwrap().clone().unwrap();
    assert_eq!(
        bmh.data.pointer("/spec/consumerRef/name"),
        Some(&serde_json::Value::String("worker-0".to_string()))
    );
    assert!(!bmh
        .metadata
        .annotations
        .unwrap_or_default()
        .contains_key(BMH_PAUSED_ANNOTATION));
}

#[tokio::test]
async fn bmh_without_a_worker_machine_stays_unreconciled() {
    let mut cluster = MockClusterApi::new();
    cluster
        .expect_list_bmhs()
        .returning(|| Ok(vec![bmh("bmh-worker-0", None)]));
    cluster.expect_list_machines().returning(|_| Ok(vec![]));
    cluster
        .expect_is_metal_provisioning_exists()
        .returning(|| Ok(false));
    cluster.expect_update_bmh_status().returning(|_| Ok(()));

    let controller = controller(
        test_config(),
        MockInventoryClient::new(),
        MockHostOps::new(),
        cluster,
    );
    assert!(!controller.update_bmhs_once().await);
}

#[tokio::test]
async fn no_bmhs_means_nothing_to_reconcile() {
    let mut cluster = MockClusterApi::new();
    cluster.expect_list_bmhs().returning(|| Ok(vec![]));

    let controller = controller(
        test_config(),
        MockInventoryClient::new(),
        MockHostOps::new(),
        cluster,
    );
    assert!(controller.update_bmhs_once().await);
}

// =========================================================================
// node labelling
// =========================================================================

#[tokio::test]
async fn node_labels_from_inventory_are_patched_onto_nodes() {
    let mut inventory = MockInventoryClient::new();
    inventory.expect_get_hosts().returning(|_| {
        let mut hosts = HashMap::new();
        let (name, mut host) = host_at(
            "node0",
            "h0",
            HostStatus::Installed,
            Some(HostStage::Done),
        );
        host.node_labels = r#"{"node.ocs.openshift.io/storage": "true"}"#.into();
        hosts.insert(name, host);
        hosts
            .insert("node1".into(), host_at("node1", "h1", HostStatus::Installed, Some(HostStage::Done)).1);
        Ok(hosts)
    });

    let mut cluster = MockClusterApi::new();
    cluster
        .expect_list_nodes()
        .returning(|| Ok(vec![node("node0", true), node("node1", true)]));
    cluster
        .expect_patch_node_labels()
        .withf(|node_name, labels| {
            node_name == "node0"
                && labels.get("node.ocs.openshift.io/storage").map(String::as_str) == Some("true")
        })
        .times(1)
        .returning(|_, _| Ok(()));

    let controller = controller(test_config(), inventory, MockHostOps::new(), cluster);
    controller.patch_node_labels().await;
}
