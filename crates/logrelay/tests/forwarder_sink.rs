//! Forwarder behavior under sink failures: outage recovery and poison.

mod common;

use std::time::Duration;

use common::{admin_flush, entry_json, post_batch, start_gateway, wait_for, MockSink, TOKEN_A};
use logrelay::auth::token_safe_name;
use serde_json::json;

fn wal_files(gateway: &common::TestGateway, token: &str) -> usize {
    let dir = gateway.state.wal.root_path().join(token_safe_name(token));
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".wal"))
            .count(),
        Err(_) => 0,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn sink_outage_then_recovery_delivers_in_order() {
    let sink = MockSink::start().await;
    sink.respond_with(503);
    let gateway = start_gateway(&sink.base_url, |_| {}).await;
    let client = reqwest::Client::new();

    // Ingest during the outage; clients must never see a failure.
    for i in 0..3 {
        let mut entry = entry_json(&format!("ordered-{i}"));
        entry["timestamp"] = json!(common::chrono_now_rfc3339());
        let response = post_batch(&client, &gateway.base_url, TOKEN_A, json!([entry])).await;
        assert_eq!(response.status(), 202, "ingest {i} failed during outage");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    admin_flush(&client, &gateway.base_url).await;

    // The forwarder retries and fails while the sink is down; the segment
    // stays on disk.
    assert!(
        wait_for(Duration::from_secs(10), || {
            sink.attempts.load(std::sync::atomic::Ordering::SeqCst) >= 1
        })
        .await,
        "forwarder never attempted a push"
    );
    assert!(sink.lines().is_empty());
    assert_eq!(wal_files(&gateway, TOKEN_A), 1);

    // Sink comes back; everything drains, in order, and the file goes away.
    sink.respond_with(204);
    assert!(
        wait_for(Duration::from_secs(20), || sink.lines().len() == 3).await,
        "segments were not delivered after recovery (got {:?})",
        sink.lines()
    );
    let lines = sink.lines();
    for (i, line) in lines.iter().enumerate() {
        assert!(
            line.contains(&format!("ordered-{i}")),
            "out of order: {lines:?}"
        );
    }
    assert!(
        wait_for(Duration::from_secs(10), || wal_files(&gateway, TOKEN_A) == 0).await,
        "delivered segment was not deleted"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn poisoned_segment_is_dropped_and_counted() {
    let sink = MockSink::start().await;
    sink.respond_with(400);
    let gateway = start_gateway(&sink.base_url, |_| {}).await;
    let client = reqwest::Client::new();

    let response = post_batch(&client, &gateway.base_url, TOKEN_A, json!([entry_json("bad")])).await;
    assert_eq!(response.status(), 202);
    admin_flush(&client, &gateway.base_url).await;

    // The 400 is permanent: no retries pile up, the segment is dropped.
    assert!(
        wait_for(Duration::from_secs(10), || wal_files(&gateway, TOKEN_A) == 0).await,
        "poisoned segment was not dropped"
    );
    assert!(sink.lines().is_empty());

    let metrics = client
        .get(format!("{}/metrics", gateway.base_url))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(
        metrics.contains("forwarder_poison_total{token=\"team-a\"} 1"),
        "poison counter missing: {metrics}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn sink_429_is_transient_not_poison() {
    let sink = MockSink::start().await;
    sink.respond_with(429);
    let gateway = start_gateway(&sink.base_url, |_| {}).await;
    let client = reqwest::Client::new();

    post_batch(&client, &gateway.base_url, TOKEN_A, json!([entry_json("x")])).await;
    admin_flush(&client, &gateway.base_url).await;

    // 429 is transient: the segment survives the failed attempts.
    assert!(
        wait_for(Duration::from_secs(5), || {
            sink.attempts.load(std::sync::atomic::Ordering::SeqCst) >= 1
        })
        .await
    );
    assert_eq!(wal_files(&gateway, TOKEN_A), 1);

    sink.respond_with(204);
    assert!(
        wait_for(Duration::from_secs(20), || sink.lines().len() == 1).await,
        "segment not delivered after 429s stopped"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn multiple_tenants_drain_independently() {
    let sink = MockSink::start().await;
    let gateway = start_gateway(&sink.base_url, |_| {}).await;
    let client = reqwest::Client::new();

    post_batch(&client, &gateway.base_url, TOKEN_A, json!([entry_json("from-a")])).await;
    post_batch(&client, &gateway.base_url, common::TOKEN_B, json!([entry_json("from-b")])).await;
    admin_flush(&client, &gateway.base_url).await;

    assert!(
        wait_for(Duration::from_secs(20), || sink.lines().len() == 2).await,
        "both tenants should deliver (got {:?})",
        sink.lines()
    );
    let lines = sink.lines().join("\n");
    assert!(lines.contains("from-a"));
    assert!(lines.contains("from-b"));
}
