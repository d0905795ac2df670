//! Streaming Proxy Integration Tests
//!
//! End to end: WebSocket clients talk to the proxy, the proxy drives a
//! Noren adapter connected to a local scripted venue.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

use common::{
    Client, ConnectionPlan, FakeVenue, Stack, depth_snapshot, eventually, fast_settings, touchline,
};

async fn running_stack(venue: &mut FakeVenue) -> (Stack, String) {
    let mut stack = Stack::new(&venue.url, fast_settings(5));
    let url = stack.serve_clients().await;
    stack.adapter.connect().await.unwrap();
    venue.expect_request("c").await;
    (stack, url)
}

#[tokio::test]
async fn shared_topic_is_subscribed_upstream_once() {
    let mut venue = FakeVenue::start(ConnectionPlan::healthy()).await;
    let (stack, url) = running_stack(&mut venue).await;

    let mut a = Client::connect(&url).await;
    let mut b = Client::connect(&url).await;

    let ack = a.subscribe("NSE", "INFY", "LTP").await;
    assert_eq!(ack, json!({"type": "ack", "action": "subscribe", "topic": "NSE:INFY:LTP"}));
    assert_eq!(venue.next_request().await.1, json!({"t": "t", "k": "NSE|1594"}));

    b.subscribe("NSE", "INFY", "LTP").await;
    assert_eq!(stack.registry.entry(&"NSE:INFY:LTP".parse().unwrap()).unwrap().refcount(), 2);

    venue.send(&touchline("NSE", "1594", "1500.25"));
    for client in [&mut a, &mut b] {
        let tick = client.expect("tick").await;
        assert_eq!(tick["topic"], "NSE:INFY:LTP");
        assert_eq!(tick["data"]["symbol"], "INFY");
        assert_eq!(tick["data"]["last_traded_price"], "1500.25");
        assert_eq!(tick["data"]["volume"], 1200);
    }

    a.unsubscribe("NSE", "INFY", "LTP").await;
    assert!(venue.stays_quiet(Duration::from_millis(200)).await);

    b.close().await;
    assert_eq!(venue.next_request().await.1, json!({"t": "u", "k": "NSE|1594"}));
    assert!(eventually(|| stack.registry.stats().topic_count == 0).await);

    // The remaining client no longer receives the topic.
    venue.send(&touchline("NSE", "1594", "1502"));
    a.send(&json!({"action": "ping"})).await;
    loop {
        let frame = a.next().await;
        assert_ne!(frame["type"], "tick");
        if frame["type"] == "pong" {
            break;
        }
    }

    stack.stop().await;
}

#[tokio::test]
async fn bad_requests_get_error_frames_and_keep_the_connection() {
    let mut venue = FakeVenue::start(ConnectionPlan::healthy()).await;
    let (stack, url) = running_stack(&mut venue).await;
    let mut client = Client::connect(&url).await;

    let cases = [
        (json!("{not json"), "invalid_json"),
        (json!({"exchange": "NSE"}), "missing_field"),
        (json!({"action": "explode"}), "unknown_action"),
        (
            json!({"action": "subscribe", "exchange": "NSE", "symbol": "INFY", "mode": "FULL"}),
            "invalid_topic",
        ),
        (
            json!({"action": "subscribe", "exchange": "CDS", "symbol": "USDINR", "mode": "LTP"}),
            "no_adapter",
        ),
    ];
    for (request, code) in cases {
        match request.as_str() {
            Some(raw) => client.send_text(raw).await,
            None => client.send(&request).await,
        }
        let error = client.expect("error").await;
        assert_eq!(error["code"], code, "request {request}");
        assert!(error["message"].as_str().is_some_and(|m| !m.is_empty()));
    }

    client.send_binary(vec![1, 2, 3]).await;
    assert_eq!(client.expect("error").await["code"], "unsupported_frame");

    client.send(&json!({"action": "ping"})).await;
    assert_eq!(client.expect("pong").await, json!({"type": "pong"}));
    assert_eq!(stack.registry.stats().topic_count, 0);
    assert!(venue.stays_quiet(Duration::from_millis(100)).await);

    stack.stop().await;
}

#[tokio::test]
async fn clients_hear_about_feed_outages_and_recovery() {
    let mut venue = FakeVenue::start(ConnectionPlan::healthy()).await;
    let (stack, url) = running_stack(&mut venue).await;
    let mut client = Client::connect(&url).await;

    client.subscribe("NSE", "INFY", "LTP").await;
    venue.expect_request("t").await;

    venue.send_raw(Message::Close(None));

    // The initial "up" may still be in flight; wait for the outage.
    let status = loop {
        let status = client.expect("status").await;
        if status["state"] != "up" {
            break status;
        }
    };
    assert_eq!(status["exchange"], "NSE");
    assert_eq!(status["broker_id"], "definedge");
    assert_eq!(status["state"], "reconnecting");

    let (conn, _) = venue.expect_request("c").await;
    assert_eq!(conn, 1);
    assert_eq!(venue.next_request().await, (1, json!({"t": "t", "k": "NSE|1594"})));

    let status = client.expect("status").await;
    assert_eq!(status["state"], "up");

    venue.send(&touchline("NSE", "1594", "1510.5"));
    let tick = client.expect("tick").await;
    assert_eq!(tick["data"]["last_traded_price"], "1510.5");

    stack.stop().await;
}

#[tokio::test]
async fn dropped_client_releases_every_topic() {
    let mut venue = FakeVenue::start(ConnectionPlan::healthy()).await;
    let (stack, url) = running_stack(&mut venue).await;
    let mut client = Client::connect(&url).await;

    client.subscribe("NSE", "INFY", "LTP").await;
    client.subscribe("NSE", "TCS", "LTP").await;
    let mut keys = vec![
        venue.next_request().await.1["k"].as_str().unwrap().to_string(),
        venue.next_request().await.1["k"].as_str().unwrap().to_string(),
    ];
    keys.sort();
    assert_eq!(keys, vec!["NSE|11536", "NSE|1594"]);
    assert_eq!(stack.bus.stats().topic_channels, 2);

    drop(client);

    let mut released = Vec::new();
    for _ in 0..2 {
        let (_, request) = venue.next_request().await;
        assert_eq!(request["t"], "u");
        released.push(request["k"].as_str().unwrap().to_string());
    }
    released.sort();
    assert_eq!(released, keys);

    assert!(eventually(|| stack.registry.stats().topic_count == 0).await);
    assert!(eventually(|| stack.bus.stats().topic_channels == 0).await);

    stack.stop().await;
}

#[tokio::test]
async fn subscriptions_snapshot_and_unsubscribe_all() {
    let mut venue = FakeVenue::start(ConnectionPlan::healthy()).await;
    let (stack, url) = running_stack(&mut venue).await;
    let mut client = Client::connect(&url).await;

    client.subscribe("NSE", "TCS", "LTP").await;
    client.subscribe("nse", "INFY", "ltp").await;
    venue.expect_request("t").await;
    venue.expect_request("t").await;

    client.send(&json!({"action": "subscriptions"})).await;
    assert_eq!(
        client.expect("subscriptions").await,
        json!({"type": "subscriptions", "topics": ["NSE:INFY:LTP", "NSE:TCS:LTP"]})
    );

    venue.send(&touchline("NSE", "11536", "3900"));
    client.expect("tick").await;
    client
        .send(&json!({"action": "snapshot", "exchange": "NSE", "symbol": "TCS", "mode": "LTP"}))
        .await;
    let snapshot = client.expect("snapshot").await;
    assert_eq!(snapshot["topic"], "NSE:TCS:LTP");
    assert_eq!(snapshot["data"]["last_traded_price"], "3900");

    client.send(&json!({"action": "unsubscribe_all"})).await;
    assert_eq!(
        client.expect("ack").await,
        json!({"type": "ack", "action": "unsubscribe_all", "count": 2})
    );
    venue.expect_request("u").await;
    venue.expect_request("u").await;
    assert_eq!(stack.registry.stats().topic_count, 0);

    // Unsubscribing again is acknowledged.
    let ack = client.unsubscribe("NSE", "TCS", "LTP").await;
    assert_eq!(ack["topic"], "NSE:TCS:LTP");

    stack.stop().await;
}

#[tokio::test]
async fn slow_client_overflow_leaves_other_clients_untouched() {
    const QUEUE: usize = 16;
    const BATCHES: usize = 1000;

    let mut venue = FakeVenue::start(ConnectionPlan::healthy()).await;
    let mut stack = Stack::new(&venue.url, fast_settings(5));
    let url = stack.serve_clients_with(QUEUE).await;
    let proxy = stack.proxy.clone().unwrap();
    stack.adapter.connect().await.unwrap();
    venue.expect_request("c").await;

    let mut fast = Client::connect(&url).await;
    // Never reads after subscribing.
    let mut slow = Client::connect_with_recv_buffer(&url, 4096).await;
    fast.subscribe("NSE", "INFY", "DEPTH").await;
    slow.subscribe("NSE", "INFY", "DEPTH").await;
    venue.expect_request("d").await;

    venue.send(&depth_snapshot("NSE", "1594", "1000"));
    assert_eq!(fast.expect("tick").await["data"]["last_traded_price"], "1000");

    // Batches no larger than the queue bound keep the reading client
    // within its own limit; the silent one overflows on its own.
    let mut price = 1000;
    for _ in 0..BATCHES {
        for _ in 0..QUEUE {
            price += 1;
            venue.send(&json!({"t": "df", "e": "NSE", "tk": "1594", "lp": price.to_string()}));
        }
        for expected in (price - QUEUE + 1)..=price {
            let tick = fast.expect("tick").await;
            assert_eq!(tick["data"]["last_traded_price"], expected.to_string());
            assert_eq!(tick["data"]["depth"]["bids"].as_array().unwrap().len(), 5);
        }
    }

    assert!(eventually(|| proxy.dropped_ticks() > 0).await);
    assert_eq!(stack.bus.stats().lagged, 0);

    drop(slow);
    stack.stop().await;
}
