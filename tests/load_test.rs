//! Load testing for the relay: many concurrent requests over one session,
//! answered out of order.

use std::time::{Duration, Instant};

use hub_relay::session::StatisticsSnapshot;

mod common;

use common::{client, ok, spawn_agent, start_relay, wait_for_session, PASSWORD};

#[tokio::test]
async fn test_concurrent_requests_over_one_session() {
    let relay = start_relay(|_| {}).await;

    // Later requests are answered first: the delay shrinks as the index grows.
    let agent = spawn_agent(&relay, "alice", PASSWORD, Some("home"), |request| async move {
        let index: u64 = request.uri.trim_start_matches("/item/").parse().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(50 - index % 50)).await;
        ok(format!("item {index}"))
    });
    let session = wait_for_session(&relay.registry, "alice", "home", None).await;

    let concurrency = 20;
    let requests_per_task = 25;
    let total_requests = concurrency * requests_per_task;

    let client = client();
    let start = Instant::now();

    let mut tasks = Vec::new();
    for task in 0..concurrency {
        let client = client.clone();
        let base = relay.url("/item");
        tasks.push(tokio::spawn(async move {
            let mut latencies = Vec::new();
            for n in 0..requests_per_task {
                let index = task * requests_per_task + n;
                let req_start = Instant::now();
                let res = client
                    .get(format!("{base}/{index}"))
                    .basic_auth("alice", Some(PASSWORD))
                    .send()
                    .await
                    .expect("Relay unreachable");
                assert!(res.status().is_success());
                assert_eq!(res.text().await.unwrap(), format!("item {index}"));
                latencies.push(req_start.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for task in tasks {
        all_latencies.extend(task.await.unwrap());
    }
    let duration = start.elapsed();

    assert_eq!(all_latencies.len(), total_requests);
    all_latencies.sort();
    let p50 = all_latencies[total_requests / 2];
    let p99 = all_latencies[total_requests * 99 / 100];
    println!("--- Load Test Results ---");
    println!("Total Requests: {}", total_requests);
    println!("Total Duration: {:?}", duration);
    println!("Throughput: {:.2} req/s", total_requests as f64 / duration.as_secs_f64());
    println!("P50 Latency: {:?}", p50);
    println!("P99 Latency: {:?}", p99);

    assert!(session.pending().is_empty());
    let stats: StatisticsSnapshot = session.stats().snapshot();
    // The handshake acknowledgement and pings count too.
    assert!(stats.messages_sent >= total_requests as u64);
    assert!(stats.messages_received >= total_requests as u64);
    assert_eq!(stats.malformed_messages_received, 0);

    agent.trigger();
    relay.shutdown.trigger();
}
