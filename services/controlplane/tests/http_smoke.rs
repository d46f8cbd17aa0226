mod common;

use axum::http::StatusCode;
use common::{TestApp, app, app_with_quota, public_and_private_apps, read_json};
use futures::StreamExt;
use http_helpers::{empty_request, json_request};
use serde_json::{Value, json};
use std::time::Duration;
use tower::ServiceExt;

async fn send(app: &TestApp, request: axum::http::Request<axum::body::Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    (status, read_json(response).await)
}

async fn create_vpc(app: &TestApp, tenant: &str, name: &str, cidr: &str) -> Value {
    let (status, body) = send(
        app,
        json_request(
            "POST",
            &format!("/v1/tenants/{tenant}/vpcs"),
            json!({"name": name, "labels": {"env": "prod"}, "spec": {"cidrBlock": cidr}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body
}

async fn create_vnet(app: &TestApp, tenant: &str, name: &str, zone: &str) {
    let (status, body) = send(
        app,
        json_request(
            "POST",
            &format!("/v1/tenants/{tenant}/vnets"),
            json!({"name": name, "spec": {"region": "r1", "availabilityZone": zone, "prefixLength": 24}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
}

fn instance(name: &str, zone: &str) -> Value {
    json!({
        "name": name,
        "spec": {
            "availabilityZone": zone,
            "instanceType": "small",
            "machineImage": "ubuntu-22.04",
            "vnet": "net1",
            "sshPublicKeyNames": ["key1"]
        }
    })
}

#[tokio::test]
async fn system_endpoints_report_identity_and_health() {
    let app = app();
    let (status, info) = send(&app, empty_request("GET", "/v1/system/info")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["region_id"], "local");
    assert_eq!(info["api_version"], "v1");
    assert_eq!(info["storage_backend"], "memory");
    assert_eq!(info["features"]["durable_storage"], false);

    let (status, health) = send(&app, empty_request("GET", "/v1/system/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");

    let (status, doc) = send(&app, empty_request("GET", "/v1/openapi.json")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["info"]["title"], "nimbus-controlplane");
}

#[tokio::test]
async fn vpc_crud_and_two_phase_delete() {
    let app = app();
    let created = create_vpc(&app, "t1", "prod", "10.0.0.0/16").await;
    let id = created["metadata"]["resourceId"].as_str().expect("id").to_string();
    let version = created["metadata"]["resourceVersion"].as_i64().expect("version");
    assert!(version > 0);
    assert_eq!(created["metadata"]["tenantId"], "t1");
    assert_eq!(created["status"]["phase"], "Ready");

    let (status, by_name) = send(&app, empty_request("GET", "/v1/tenants/t1/vpcs/name/prod")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(by_name["metadata"]["resourceId"], id.as_str());

    let (status, _) = send(&app, empty_request("GET", "/v1/tenants/t2/vpcs/name/prod")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, updated) = send(
        &app,
        json_request(
            "PUT",
            &format!("/v1/tenants/t1/vpcs/id/{id}"),
            json!({"resourceVersion": version, "labels": {"env": "staging"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{updated}");
    assert_eq!(updated["metadata"]["labels"]["env"], "staging");
    assert!(updated["metadata"]["resourceVersion"].as_i64().expect("version") > version);

    let (status, stale) = send(
        &app,
        json_request(
            "PUT",
            &format!("/v1/tenants/t1/vpcs/id/{id}"),
            json!({"resourceVersion": version, "labels": {"env": "dev"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(stale["code"], "failed_precondition");

    let (status, early) = send(
        &app,
        empty_request("POST", &format!("/v1/tenants/t1/vpcs/id/{id}/remove-finalizer")),
    )
    .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED, "{early}");

    let (status, deleting) = send(&app, empty_request("DELETE", "/v1/tenants/t1/vpcs/name/prod")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(deleting["metadata"]["deletionTimestamp"].is_string());
    assert_eq!(deleting["status"]["phase"], "Deleting");

    let (status, _) = send(&app, empty_request("GET", &format!("/v1/tenants/t1/vpcs/id/{id}"))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        empty_request("POST", &format!("/v1/tenants/t1/vpcs/id/{id}/remove-finalizer")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, missing) = send(&app, empty_request("GET", &format!("/v1/tenants/t1/vpcs/id/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(missing["code"], "not_found");

    // The name is free again once the old record is finalized.
    create_vpc(&app, "t1", "prod", "10.0.0.0/16").await;
}

#[tokio::test]
async fn create_rejects_duplicates_and_bad_input() {
    let app = app();
    let created = create_vpc(&app, "t1", "prod", "10.0.0.0/16").await;

    let (status, dup) = send(
        &app,
        json_request("POST", "/v1/tenants/t1/vpcs", json!({"name": "prod", "spec": {"cidrBlock": "10.1.0.0/16"}})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(dup["code"], "already_exists");

    let (status, bad) = send(
        &app,
        json_request("POST", "/v1/tenants/t1/vpcs", json!({"spec": {"cidrBlock": "not-a-cidr"}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(bad["code"], "validation_error");

    for cidr in ["10.0.0.0/8", "169.254.0.0/16", "0.0.0.0/0"] {
        let (status, body) = send(
            &app,
            json_request("POST", "/v1/tenants/t1/vpcs", json!({"spec": {"cidrBlock": cidr}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{cidr}: {body}");
    }

    let (status, _) = send(&app, empty_request("GET", "/v1/tenants/t1/vpcs/id/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let id = created["metadata"]["resourceId"].as_str().expect("id");
    let (status, immutable) = send(
        &app,
        json_request(
            "PUT",
            &format!("/v1/tenants/t1/vpcs/id/{id}"),
            json!({"spec": {"cidrBlock": "10.9.0.0/16"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(immutable["message"].as_str().expect("message").contains("cidrBlock"));
}

#[tokio::test]
async fn unnamed_records_are_named_after_their_id() {
    let app = app();
    let (status, created) = send(
        &app,
        json_request("POST", "/v1/tenants/t1/vpcs", json!({"spec": {"cidrBlock": "10.0.0.0/16"}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["metadata"]["name"], created["metadata"]["resourceId"]);
}

#[tokio::test]
async fn search_filters_by_labels_and_spec_fields() {
    let app = app();
    create_vpc(&app, "t1", "b", "10.1.0.0/16").await;
    create_vpc(&app, "t1", "a", "10.0.0.0/16").await;
    create_vpc(&app, "t2", "c", "10.0.0.0/16").await;

    let (status, all) = send(&app, empty_request("GET", "/v1/tenants/t1/vpcs")).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = all["items"]
        .as_array()
        .expect("items")
        .iter()
        .map(|item| item["metadata"]["name"].as_str().expect("name"))
        .collect();
    assert_eq!(names, vec!["a", "b"]);

    let (_, by_label) = send(&app, empty_request("GET", "/v1/tenants/t1/vpcs?labels.env=prod")).await;
    assert_eq!(by_label["items"].as_array().expect("items").len(), 2);

    let (_, by_spec) = send(
        &app,
        empty_request("GET", "/v1/tenants/t1/vpcs?spec.cidrBlock=10.1.0.0/16"),
    )
    .await;
    let items = by_spec["items"].as_array().expect("items");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["metadata"]["name"], "b");

    let (status, rejected) = send(&app, empty_request("GET", "/v1/tenants/t1/vpcs?color=red")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(rejected["code"], "validation_error");
}

#[tokio::test]
async fn subnet_allocation_enforces_vpc_range() {
    let app = app();
    let vpc = create_vpc(&app, "t1", "net", "10.0.0.0/16").await;
    let vpc_id = vpc["metadata"]["resourceId"].as_str().expect("id");

    let subnet = |name: &str, cidr: &str| {
        json_request(
            "POST",
            "/v1/tenants/t1/subnets",
            json!({"name": name, "spec": {"vpcId": vpc_id, "cidrBlock": cidr, "availabilityZone": "az1"}}),
        )
    };

    let (status, first) = send(&app, subnet("s1", "10.0.1.0/24")).await;
    assert_eq!(status, StatusCode::CREATED, "{first}");
    assert_eq!(first["spec"]["vpcId"], vpc_id);

    let (status, overlap) = send(&app, subnet("s2", "10.0.1.128/25")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        overlap["message"],
        "subnet CIDR overlaps with existing subnet CIDR within the VPC."
    );

    let (status, outside) = send(&app, subnet("s3", "10.1.0.0/24")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(outside["message"], "subnet CIDR is not within VPC CIDR.");

    let (status, _) = send(&app, subnet("s4", "10.0.2.0/24")).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, unknown) = send(
        &app,
        json_request(
            "POST",
            "/v1/tenants/t1/subnets",
            json!({"spec": {"vpcId": uuid::Uuid::new_v4(), "cidrBlock": "10.0.3.0/24", "availabilityZone": "az1"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(unknown["message"], "invalid vpcId");
}

#[tokio::test]
async fn instance_create_schedules_and_supports_dry_run() {
    let app = app();
    create_vnet(&app, "t1", "net1", "az1").await;

    let (status, dry) = send(
        &app,
        json_request("POST", "/v1/tenants/t1/instances?dry_run=true", instance("vm1", "az1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{dry}");
    assert_eq!(dry["spec"]["clusterId"], "c1");
    let (status, _) = send(&app, empty_request("GET", "/v1/tenants/t1/instances/name/vm1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, created) = send(
        &app,
        json_request("POST", "/v1/tenants/t1/instances", instance("vm1", "az1")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(created["spec"]["clusterId"], "c1");
    assert_eq!(created["spec"]["nodeId"], "n0");
    assert_eq!(created["status"]["phase"], "Provisioning");

    let id = created["metadata"]["resourceId"].as_str().expect("id");
    let (status, ready) = send(
        &app,
        json_request(
            "PUT",
            &format!("/v1/tenants/t1/instances/id/{id}/status"),
            json!({"status": {"phase": "Ready", "message": "running"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{ready}");
    assert_eq!(ready["status"]["phase"], "Ready");
    assert_eq!(ready["spec"]["nodeId"], "n0");

    let (status, wrong_zone) = send(
        &app,
        json_request("POST", "/v1/tenants/t1/instances", instance("vm2", "az2")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{wrong_zone}");
}

#[tokio::test]
async fn instance_batch_is_all_or_nothing() {
    let app = app();
    create_vnet(&app, "t1", "net1", "az1").await;

    let (status, created) = send(
        &app,
        json_request(
            "POST",
            "/v1/tenants/t1/instances/batch",
            json!({"instances": [instance("a", "az1"), instance("b", "az1")]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    let nodes: Vec<&str> = created
        .as_array()
        .expect("array")
        .iter()
        .map(|item| item["spec"]["nodeId"].as_str().expect("node"))
        .collect();
    assert_eq!(nodes, vec!["n0", "n1"]);

    let (status, dup) = send(
        &app,
        json_request(
            "POST",
            "/v1/tenants/t1/instances/batch",
            json!({"instances": [instance("c", "az1"), instance("a", "az1")]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{dup}");
    let (status, _) = send(&app, empty_request("GET", "/v1/tenants/t1/instances/name/c")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn instance_quota_is_enforced_per_type() {
    let app = app_with_quota(1);
    create_vnet(&app, "t1", "net1", "az1").await;

    let (status, _) = send(
        &app,
        json_request("POST", "/v1/tenants/t1/instances", instance("vm1", "az1")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, rejected) = send(
        &app,
        json_request("POST", "/v1/tenants/t1/instances", instance("vm2", "az1")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(rejected["code"], "out_of_range");
    assert_eq!(
        rejected["message"],
        "Your account has reached the maximum allowed limit for the small instance you requested"
    );
}

#[tokio::test]
async fn tenant_requests_cannot_skip_quota() {
    let app = app_with_quota(1);
    create_vnet(&app, "t1", "net1", "az1").await;

    let with_flag = |name: &str| {
        let mut body = instance(name, "az1");
        body["skipQuotaCheck"] = json!(true);
        body["spec"]["skipQuotaCheck"] = json!(true);
        body
    };
    let (status, first) = send(
        &app,
        json_request("POST", "/v1/tenants/t1/instances", with_flag("vm1")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{first}");
    assert!(first["spec"].get("skipQuotaCheck").is_none());

    let (status, single) = send(
        &app,
        json_request("POST", "/v1/tenants/t1/instances", with_flag("vm2")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{single}");
    assert_eq!(single["code"], "out_of_range");

    let (status, batch) = send(
        &app,
        json_request(
            "POST",
            "/v1/tenants/t1/instances/batch",
            json!({"instances": [with_flag("vm3")], "skipQuotaCheck": true}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{batch}");
    assert_eq!(batch["code"], "out_of_range");

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/private/tenants/t1/instances/batch",
            json!({"instances": [instance("vm4", "az1")], "skipQuotaCheck": true}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn tenant_placement_is_replaced_by_the_scheduler() {
    let app = app();
    create_vnet(&app, "t1", "net1", "az1").await;
    let mut body = instance("vm1", "az1");
    body["spec"]["clusterId"] = json!("chosen");
    body["spec"]["nodeId"] = json!("chosen-node");

    let (status, created) = send(&app, json_request("POST", "/v1/tenants/t1/instances", body)).await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(created["spec"]["clusterId"], "c1");
    assert_eq!(created["spec"]["nodeId"], "n0");
}

#[tokio::test]
async fn private_batches_may_skip_quota_and_carry_placement() {
    let (public, private) = public_and_private_apps(1);
    create_vnet(&public, "t1", "net1", "az1").await;

    let placed = |name: &str, node: &str| {
        let mut body = instance(name, "az1");
        body["spec"]["clusterId"] = json!("edge");
        body["spec"]["nodeId"] = json!(node);
        body
    };
    let (status, created) = send(
        &private,
        json_request(
            "POST",
            "/v1/private/tenants/t1/instances/batch",
            json!({"instances": [placed("a", "x1"), placed("b", "x2")], "skipQuotaCheck": true}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    let nodes: Vec<&str> = created
        .as_array()
        .expect("array")
        .iter()
        .map(|item| item["spec"]["nodeId"].as_str().expect("node"))
        .collect();
    assert_eq!(nodes, vec!["x1", "x2"]);

    let (status, over) = send(
        &private,
        json_request(
            "POST",
            "/v1/private/tenants/t1/instances/batch",
            json!({"instances": [instance("c", "az1")]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{over}");
    assert_eq!(over["code"], "out_of_range");

    let (status, mixed) = send(
        &private,
        json_request(
            "POST",
            "/v1/private/tenants/t1/instances/batch",
            json!({"instances": [placed("d", "x3"), instance("e", "az1")], "skipQuotaCheck": true}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{mixed}");
    let (status, _) = send(&public, empty_request("GET", "/v1/tenants/t1/instances/name/d")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn instance_update_only_touches_ssh_keys() {
    let app = app();
    create_vnet(&app, "t1", "net1", "az1").await;
    let (status, created) = send(
        &app,
        json_request("POST", "/v1/tenants/t1/instances", instance("vm1", "az1")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");

    let mut spec = instance("vm1", "az1")["spec"].clone();
    spec["sshPublicKeyNames"] = json!(["key2"]);
    spec["nodeId"] = json!("elsewhere");
    let (status, updated) = send(
        &app,
        json_request("PUT", "/v1/tenants/t1/instances/name/vm1", json!({"spec": spec})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{updated}");
    assert_eq!(updated["spec"]["sshPublicKeyNames"], json!(["key2"]));
    assert_eq!(updated["spec"]["nodeId"], "n0");
    assert_eq!(updated["spec"]["clusterId"], "c1");

    let mut resize = instance("vm1", "az1")["spec"].clone();
    resize["instanceType"] = json!("large");
    let (status, rejected) = send(
        &app,
        json_request("PUT", "/v1/tenants/t1/instances/name/vm1", json!({"spec": resize})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(rejected["message"].as_str().expect("message").contains("instanceType"));
}

#[tokio::test]
async fn port_reservation_checks_the_subnet() {
    let app = app();
    let vpc = create_vpc(&app, "t1", "net", "10.0.0.0/16").await;
    let vpc_id = vpc["metadata"]["resourceId"].as_str().expect("id");
    let (status, subnet) = send(
        &app,
        json_request(
            "POST",
            "/v1/tenants/t1/subnets",
            json!({"name": "s1", "spec": {"vpcId": vpc_id, "cidrBlock": "10.0.1.0/24", "availabilityZone": "az1"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{subnet}");
    let subnet_id = subnet["metadata"]["resourceId"].as_str().expect("id");

    let port = |tenant: &str, subnet_id: &str, ip: &str| {
        json_request(
            "POST",
            &format!("/v1/tenants/{tenant}/ports"),
            json!({"spec": {"subnetId": subnet_id, "ipAddress": ip, "macAddress": "02:42:ac:11:00:02"}}),
        )
    };

    let (status, unknown) = send(&app, port("t1", &uuid::Uuid::new_v4().to_string(), "10.0.1.5")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(unknown["message"], "invalid subnet");

    let (status, foreign) = send(&app, port("t2", subnet_id, "10.0.1.5")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(foreign["message"], "invalid subnet");

    let (status, outside) = send(&app, port("t1", subnet_id, "10.0.9.5")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{outside}");

    let (status, created) = send(&app, port("t1", subnet_id, "10.0.1.5")).await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    let (status, again) = send(&app, port("t1", subnet_id, "10.0.1.5")).await;
    assert_eq!(status, StatusCode::OK, "{again}");
    assert_eq!(again["metadata"]["resourceId"], created["metadata"]["resourceId"]);
}

#[tokio::test]
async fn instance_group_lifecycle() {
    let app = app();
    create_vnet(&app, "t1", "net1", "az1").await;
    let group = json!({
        "name": "web",
        "spec": instance("ignored", "az1")["spec"].clone(),
        "instanceCount": 2
    });

    let (status, created) = send(&app, json_request("POST", "/v1/tenants/t1/instance-groups", group.clone())).await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(created["instanceCount"], 2);
    assert_eq!(created["readyCount"], 0);
    let (status, member) = send(&app, empty_request("GET", "/v1/tenants/t1/instances/name/web-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(member["spec"]["instanceGroup"], "web");

    let (status, dup) = send(&app, json_request("POST", "/v1/tenants/t1/instance-groups", group)).await;
    assert_eq!(status, StatusCode::CONFLICT, "{dup}");

    let (status, scaled) = send(
        &app,
        json_request(
            "POST",
            "/v1/tenants/t1/instance-groups/web/scale-up",
            json!({"instanceCount": 3}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{scaled}");
    assert_eq!(scaled["newMembers"], json!(["web-2"]));
    assert_eq!(scaled["currentCount"], 3);

    let (status, shrink) = send(
        &app,
        json_request(
            "POST",
            "/v1/tenants/t1/instance-groups/web/scale-up",
            json!({"instanceCount": 1}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{shrink}");

    let (status, removed) = send(
        &app,
        empty_request("DELETE", "/v1/tenants/t1/instance-groups/web/members/name/web-0"),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{removed}");
    assert!(removed["metadata"]["deletionTimestamp"].is_string());

    let (status, list) = send(&app, empty_request("GET", "/v1/tenants/t1/instance-groups")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["items"][0]["name"], "web");
    assert_eq!(list["items"][0]["instanceCount"], 3);

    let (status, deleting) = send(&app, empty_request("DELETE", "/v1/tenants/t1/instance-groups/web")).await;
    assert_eq!(status, StatusCode::OK, "{deleting}");
    let (status, _) = send(&app, empty_request("GET", "/v1/tenants/t1/instance-groups/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, empty_request("GET", "/v1/tenants/t1/instance-groups/Bad_Name")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn private_group_create_reports_placement() {
    let (public, private) = public_and_private_apps(1);
    create_vnet(&public, "t1", "net1", "az1").await;
    let (status, placed) = send(
        &private,
        json_request(
            "POST",
            "/v1/private/tenants/t1/instance-groups",
            json!({
                "name": "batch",
                "spec": instance("ignored", "az1")["spec"].clone(),
                "instanceCount": 2,
                "skipQuotaCheck": true
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{placed}");
    assert_eq!(placed["group"]["instanceCount"], 2);
    assert_eq!(placed["clusterIds"], json!(["c1"]));
    assert_eq!(placed["nodeIds"], json!(["n0", "n1"]));
}

#[tokio::test]
async fn search_stream_ends_with_bookmark() {
    let app = app();
    create_vpc(&app, "t1", "a", "10.0.0.0/16").await;
    let last = create_vpc(&app, "t2", "b", "10.0.0.0/16").await;
    let last_version = last["metadata"]["resourceVersion"].as_i64().expect("version");

    let (status, events) = send(&app, empty_request("GET", "/v1/vpcs/search-stream")).await;
    assert_eq!(status, StatusCode::OK);
    let events = events.as_array().expect("events");
    assert_eq!(events.len(), 3);
    assert!(events[..2].iter().all(|event| event["type"] == "UPDATED"));
    assert_eq!(events[2]["type"], "BOOKMARK");
    assert_eq!(events[2]["resourceVersion"], last_version);

    let (_, scoped) = send(&app, empty_request("GET", "/v1/vpcs/search-stream?tenant_id=t1")).await;
    let scoped = scoped.as_array().expect("events");
    assert_eq!(scoped.len(), 2);
    assert_eq!(scoped[0]["object"]["metadata"]["tenantId"], "t1");
}

#[tokio::test]
async fn watch_streams_changes_as_server_sent_events() {
    let app = app();
    create_vpc(&app, "t1", "watched", "10.0.0.0/16").await;

    let response = app
        .clone()
        .oneshot(empty_request("GET", "/v1/vpcs/watch?after_version=0"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body().into_data_stream();

    let mut text = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !text.contains("event: bookmark") {
        let chunk = tokio::time::timeout_at(deadline, body.next())
            .await
            .expect("watch produced a bookmark in time")
            .expect("stream open")
            .expect("chunk");
        text.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(text.contains("event: updated"));
    assert!(text.contains("\"watched\""));

    let (status, _) = send(&app, empty_request("GET", "/v1/vpcs/watch?after_version=-1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
