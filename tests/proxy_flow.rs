//! End-to-end tests for the request lifecycle.

use std::time::Duration;

use axum::http::StatusCode;
use har_proxy::config::ProxyConfig;

mod common;

fn config_with_collector(collector: std::net::SocketAddr) -> ProxyConfig {
    ProxyConfig {
        collector: collector.to_string(),
        ..ProxyConfig::default()
    }
}

#[tokio::test]
async fn forwards_and_archives_with_the_startup_token() {
    let (collector, mut datapoints) = common::start_collector().await;
    let (upstream, _requests) =
        common::start_upstream(|_| async { (StatusCode::OK, vec![b'x'; 42]) }).await;

    let mut config = config_with_collector(collector);
    config.default_token = Some("T1".to_string());
    let (proxy, engine) = common::start_proxy(config).await;

    let client = common::proxy_client(proxy);
    let res = client
        .get(format!("http://{upstream}/get"))
        .send()
        .await
        .expect("request through proxy");

    assert_eq!(res.status(), 200);
    assert!(
        res.headers().get("content-length").is_none(),
        "responses are re-streamed chunked"
    );
    assert_eq!(res.bytes().await.expect("body").len(), 42);

    let har = common::next_datapoint(&mut datapoints).await;
    assert_eq!(har["serviceToken"], "T1");
    assert_eq!(har["clientIPAddress"], "127.0.0.1");
    assert_eq!(har["serverIPAddress"], "127.0.0.1");
    assert_eq!(har["request"]["method"], "GET");
    assert_eq!(har["response"]["status"], 200);
    assert_eq!(har["response"]["bodySize"], 42);
    assert!(har["timings"]["wait"].as_u64().is_some());
    assert!(har["startedDateTime"].as_str().expect("timestamp").ends_with('Z'));

    common::wait_for_idle(&engine).await;
}

#[tokio::test]
async fn request_token_overrides_the_startup_token_and_is_stripped() {
    let (collector, mut datapoints) = common::start_collector().await;
    let (upstream, mut requests) =
        common::start_upstream(|_| async { (StatusCode::OK, b"ok".to_vec()) }).await;

    let mut config = config_with_collector(collector);
    config.default_token = Some("T1".to_string());
    let (proxy, _engine) = common::start_proxy(config).await;

    let client = common::proxy_client(proxy);
    let res = client
        .get(format!("http://{upstream}/get"))
        .header("Service-Token", "T2")
        .header("Host", "spoofed.internal")
        .send()
        .await
        .expect("request through proxy");
    assert_eq!(res.status(), 200);

    let captured = tokio::time::timeout(Duration::from_secs(5), requests.recv())
        .await
        .expect("upstream saw the request")
        .expect("capture channel open");
    assert!(
        captured.headers.get("service-token").is_none(),
        "the token never reaches the upstream"
    );
    // The inbound Host is dropped; whatever the upstream sees was derived
    // from the request URI by the upstream client, never the client's value.
    let upstream_host = captured
        .headers
        .get("host")
        .expect("http/1.1 carries a host")
        .to_str()
        .expect("ascii");
    assert_eq!(upstream_host, upstream.to_string());
    assert_ne!(upstream_host, "spoofed.internal");
    let forwarded_for = captured
        .headers
        .get("x-forwarded-for")
        .expect("x-forwarded-for set")
        .to_str()
        .expect("ascii");
    assert!(forwarded_for.contains("127.0.0.1"));

    let har = common::next_datapoint(&mut datapoints).await;
    assert_eq!(har["serviceToken"], "T2");
    // The archived request is also scrubbed.
    let archived = har["request"]["headers"]
        .as_array()
        .expect("headers array");
    assert!(archived
        .iter()
        .all(|h| h["name"].as_str() != Some("service-token")));
}

#[tokio::test]
async fn missing_token_rejects_without_a_datapoint() {
    let (collector, mut datapoints) = common::start_collector().await;
    let (upstream, _requests) =
        common::start_upstream(|_| async { (StatusCode::OK, b"ok".to_vec()) }).await;

    let config = config_with_collector(collector);
    let (proxy, engine) = common::start_proxy(config).await;

    let client = common::proxy_client(proxy);
    let res = client
        .get(format!("http://{upstream}/get"))
        .send()
        .await
        .expect("request through proxy");

    assert_eq!(res.status(), 500);
    let body = res.text().await.expect("body");
    assert!(body.contains("Service-Token header missing"));

    common::wait_for_idle(&engine).await;
    assert!(
        tokio::time::timeout(Duration::from_secs(1), datapoints.recv())
            .await
            .is_err(),
        "no datapoint without a token"
    );
}

#[tokio::test]
async fn saturation_rejects_with_503_and_a_zero_receive_datapoint() {
    let (collector, mut datapoints) = common::start_collector().await;
    let (upstream, _requests) = common::start_upstream(|_| async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        (StatusCode::OK, b"slow".to_vec())
    })
    .await;

    let mut config = config_with_collector(collector);
    config.default_token = Some("T1".to_string());
    config.concurrency_limit = 1;
    let (proxy, engine) = common::start_proxy(config).await;

    let client = common::proxy_client(proxy);
    let url = format!("http://{upstream}/slow");

    let held = {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move { client.get(&url).send().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let rejected = client.get(&url).send().await.expect("second request");
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);

    let first = held
        .await
        .expect("join")
        .expect("held request completes");
    assert_eq!(first.status(), 200);

    common::wait_for_idle(&engine).await;
    assert_eq!(engine.in_flight(), 0);

    let a = common::next_datapoint(&mut datapoints).await;
    let b = common::next_datapoint(&mut datapoints).await;
    let overloaded = [&a, &b]
        .into_iter()
        .find(|har| har["response"]["status"] == 503)
        .expect("a datapoint for the rejected request");
    assert_eq!(overloaded["timings"]["receive"], 0);
}

#[tokio::test]
async fn slow_upstreams_time_out_with_504() {
    let (collector, mut datapoints) = common::start_collector().await;
    let (upstream, _requests) = common::start_upstream(|_| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        (StatusCode::OK, b"late".to_vec())
    })
    .await;

    let mut config = config_with_collector(collector);
    config.default_token = Some("T1".to_string());
    config.call_timeout = Duration::from_secs(1);
    let (proxy, engine) = common::start_proxy(config).await;

    let client = common::proxy_client(proxy);
    let res = client
        .get(format!("http://{upstream}/sleep"))
        .send()
        .await
        .expect("request through proxy");
    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);

    let har = common::next_datapoint(&mut datapoints).await;
    assert_eq!(har["response"]["status"], 504);
    assert_eq!(har["timings"]["receive"], 0);
    let wait = har["timings"]["wait"].as_u64().expect("wait");
    assert!(
        (900..=2000).contains(&wait),
        "wait should sit near the 1s deadline, got {wait}"
    );

    common::wait_for_idle(&engine).await;
}

#[tokio::test]
async fn an_echoing_upstream_meters_equal_body_lengths() {
    let (collector, mut datapoints) = common::start_collector().await;
    let (upstream, _requests) =
        common::start_upstream(|body| async move { (StatusCode::OK, body) }).await;

    let mut config = config_with_collector(collector);
    config.default_token = Some("T1".to_string());
    let (proxy, _engine) = common::start_proxy(config).await;

    let payload = vec![b'y'; 42];
    let client = common::proxy_client(proxy);
    let res = client
        .post(format!("http://{upstream}/echo"))
        .body(payload.clone())
        .send()
        .await
        .expect("request through proxy");
    assert_eq!(res.bytes().await.expect("body").to_vec(), payload);

    let har = common::next_datapoint(&mut datapoints).await;
    assert_eq!(har["request"]["bodySize"], 42);
    assert_eq!(har["response"]["bodySize"], 42);
}

#[tokio::test]
async fn an_unreachable_collector_never_disturbs_the_client() {
    // Nothing listens on this collector address.
    let mut config = ProxyConfig {
        collector: "127.0.0.1:9".to_string(),
        ..ProxyConfig::default()
    };
    config.default_token = Some("T1".to_string());

    let (upstream, _requests) =
        common::start_upstream(|_| async { (StatusCode::OK, b"fine".to_vec()) }).await;
    let (proxy, engine) = common::start_proxy(config).await;

    let client = common::proxy_client(proxy);
    let res = client
        .get(format!("http://{upstream}/get"))
        .send()
        .await
        .expect("request through proxy");
    assert_eq!(res.status(), 200);
    assert_eq!(res.bytes().await.expect("body").as_ref(), b"fine");

    common::wait_for_idle(&engine).await;
}

#[tokio::test]
async fn a_parallel_workload_drains_the_gate_to_zero() {
    let (collector, mut datapoints) = common::start_collector().await;
    let (upstream, _requests) =
        common::start_upstream(|_| async { (StatusCode::OK, b"ok".to_vec()) }).await;

    let mut config = config_with_collector(collector);
    config.default_token = Some("T1".to_string());
    let (proxy, engine) = common::start_proxy(config).await;

    let client = common::proxy_client(proxy);
    let mut handles = Vec::new();
    for _ in 0..5 {
        let client = client.clone();
        let url = format!("http://{upstream}/get");
        handles.push(tokio::spawn(async move {
            client.get(&url).send().await.expect("request").status()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.expect("join"), 200);
    }

    common::wait_for_idle(&engine).await;
    for _ in 0..5 {
        let har = common::next_datapoint(&mut datapoints).await;
        assert_eq!(har["serviceToken"], "T1");
    }
}
