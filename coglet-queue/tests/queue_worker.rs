//! End-to-end tests: MemoryQueue -> QueueWorker -> demo worker subprocess.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use coglet_queue::{ConsumerError, MemoryQueue, RunnerError, WebhookConfig};
use common::{Demo, assert_well_formed, entry, responses, run_one, wait_for};

#[tokio::test]
async fn uploads_file_output_and_posts_webhooks() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/input.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("test"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"url": "http://upload-server:5000/download/output.txt"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut demo = Demo::new("files", dir.path());
    demo.upload_url = Some(format!("{}/upload", server.uri()));
    let queue = Arc::new(MemoryQueue::new());
    let running = demo.spawn(queue.clone());

    queue.push(
        json!({
            "id": "files-1",
            "input": {"text": "baz", "path": format!("{}/input.txt", server.uri())},
            "webhook": format!("{}/webhook", server.uri()),
        })
        .to_string(),
    );
    wait_for(Duration::from_secs(20), || queue.acked().len() == 1).await;
    running.stop().await;

    let requests = server.received_requests().await.unwrap();
    let upload = requests
        .iter()
        .find(|r| r.url.path() == "/upload")
        .expect("no upload");
    let body = String::from_utf8_lossy(&upload.body);
    assert!(body.contains("foobaztest"), "{body}");
    assert!(body.contains("name=\"file\""));

    let webhooks: Vec<Value> = requests
        .iter()
        .filter(|r| r.url.path() == "/webhook")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    assert_well_formed(&webhooks);
    assert_eq!(webhooks[0]["status"], "processing");
    assert_eq!(webhooks[0]["output"], Value::Null);
    assert!(webhooks[0]["x-experimental-timestamps"]["started_at"].is_string());

    let last = webhooks.last().unwrap();
    assert_eq!(last["status"], "succeeded");
    assert_eq!(
        last["output"],
        "http://upload-server:5000/download/output.txt"
    );
    assert_eq!(last["logs"], json!([]));
    assert!(last.get("error").is_none());
}

#[tokio::test]
async fn yielded_outputs_grow_monotonically() {
    let dir = tempfile::tempdir().unwrap();
    let snapshots = run_one(Demo::new("yielding", dir.path()), json!({})).await;
    assert_well_formed(&snapshots);

    let outputs: Vec<Vec<Value>> = snapshots
        .iter()
        .filter_map(|s| s["output"].as_array().cloned())
        .collect();
    for pair in outputs.windows(2) {
        assert!(pair[1].starts_with(&pair[0]), "{:?} -> {:?}", pair[0], pair[1]);
    }

    let last = snapshots.last().unwrap();
    assert_eq!(last["status"], "succeeded");
    assert_eq!(last["output"], json!(["foo", "bar", "baz"]));
}

#[tokio::test]
async fn yielded_files_are_inlined_without_upload_url() {
    let dir = tempfile::tempdir().unwrap();
    let snapshots = run_one(Demo::new("yielding_file", dir.path()), json!({})).await;
    let last = snapshots.last().unwrap();
    assert_eq!(last["status"], "succeeded");
    assert_eq!(
        last["output"],
        json!([
            "data:text/plain;base64,dGVzdCBmb28=",
            "data:text/plain;base64,dGVzdCBiYXI=",
            "data:text/plain;base64,dGVzdCBiYXo=",
        ])
    );
}

#[tokio::test]
async fn complex_outputs_keep_their_shape() {
    let dir = tempfile::tempdir().unwrap();
    let snapshots = run_one(Demo::new("complex", dir.path()), json!({"name": "world"})).await;
    assert_eq!(
        snapshots.last().unwrap()["output"],
        json!({"hello": "hello world", "goodbye": "goodbye world"})
    );

    let snapshots = run_one(Demo::new("yielding_complex_list", dir.path()), json!({})).await;
    assert_eq!(
        snapshots.last().unwrap()["output"],
        json!([[{"text": "hello", "file": "data:text/plain;base64,aGVsbG8="}]])
    );
}

#[tokio::test]
async fn error_after_output_keeps_partial_output_and_traceback() {
    let dir = tempfile::tempdir().unwrap();
    let snapshots = run_one(Demo::new("failing_after_output", dir.path()), json!({})).await;
    assert_well_formed(&snapshots);

    let last = snapshots.last().unwrap();
    assert_eq!(last["status"], "failed");
    assert_eq!(last["error"], "mid run error");
    assert_eq!(last["output"], json!(["hello bar"]));

    let logs: Vec<&str> = last["logs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l.as_str().unwrap())
        .collect();
    assert!(logs.contains(&"a printed log message"), "{logs:?}");
    assert!(logs.contains(&"Traceback (most recent call last):"), "{logs:?}");
}

#[tokio::test]
async fn invalid_input_fails_before_processing() {
    let dir = tempfile::tempdir().unwrap();
    let snapshots = run_one(Demo::new("int", dir.path()), json!({"num": "not a number"})).await;

    assert_eq!(snapshots.len(), 1, "{snapshots:?}");
    let only = &snapshots[0];
    assert_eq!(only["status"], "failed");
    assert_eq!(only["output"], Value::Null);
    assert_eq!(only["logs"], json!([]));
    assert!(
        only["error"]
            .as_str()
            .unwrap()
            .contains("value is not a valid integer")
    );
    assert!(only.get("x-experimental-timestamps").is_none());
}

#[tokio::test]
async fn valid_input_passes_validation() {
    let dir = tempfile::tempdir().unwrap();
    let snapshots = run_one(Demo::new("int", dir.path()), json!({"num": 21})).await;
    let last = snapshots.last().unwrap();
    assert_eq!(last["status"], "succeeded");
    assert_eq!(last["output"], 42);
}

#[tokio::test]
async fn captures_stdout_and_stderr_before_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(MemoryQueue::new());
    let running = Demo::new("logging", dir.path()).spawn(queue.clone());
    queue.push(entry("logs-1", json!({}), "resp"));
    wait_for(Duration::from_secs(20), || queue.acked().len() == 1).await;
    running.stop().await;

    let snapshots = responses(&queue, "resp");
    assert_well_formed(&snapshots);
    let last = snapshots.last().unwrap();
    assert_eq!(last["status"], "succeeded");
    assert_eq!(last["output"], "output");

    let mut logs: Vec<String> = serde_json::from_value(last["logs"].clone()).unwrap();
    logs.sort();
    assert_eq!(
        logs,
        vec![
            "WARNING:root:writing log message",
            "writing from C",
            "writing to stderr",
            "writing with print",
        ]
    );

    let published: Vec<String> = queue
        .published_logs()
        .into_iter()
        .filter(|(id, _)| id == "logs-1")
        .map(|(_, line)| line)
        .collect();
    assert_eq!(published.len(), 4);
}

#[tokio::test]
async fn timeout_fails_prediction_and_worker_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let mut demo = Demo::new("sleep", dir.path());
    demo.timeout = Some(Duration::from_secs(2));
    let queue = Arc::new(MemoryQueue::new());
    let running = demo.spawn(queue.clone());

    queue.push(entry("fast", json!({"sleep_time": 0.1}), "fast"));
    queue.push(entry("slow", json!({"sleep_time": 3.0}), "slow"));
    queue.push(entry("again", json!({"sleep_time": 0.2}), "again"));
    wait_for(Duration::from_secs(30), || queue.acked().len() == 3).await;
    running.stop().await;

    let fast = responses(&queue, "fast");
    assert_eq!(fast.last().unwrap()["status"], "succeeded");
    assert_eq!(
        fast.last().unwrap()["output"],
        "it worked after 0.1 seconds!"
    );

    let slow = responses(&queue, "slow");
    assert_well_formed(&slow);
    assert_eq!(slow.last().unwrap()["status"], "failed");
    assert_eq!(slow.last().unwrap()["error"], "Prediction timed out");

    let again = responses(&queue, "again");
    assert_eq!(
        again.last().unwrap()["output"],
        "it worked after 0.2 seconds!"
    );
}

#[tokio::test]
async fn timeout_keeps_yielded_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut demo = Demo::new("yielding_timeout", dir.path());
    demo.timeout = Some(Duration::from_secs(2));
    let snapshots = run_one(demo, json!({"sleep_time": 0.8, "n_iterations": 10})).await;

    let last = snapshots.last().unwrap();
    assert_eq!(last["status"], "failed");
    assert_eq!(last["error"], "Prediction timed out");
    assert_eq!(last["output"], json!(["yield 0", "yield 1"]));
}

#[tokio::test]
async fn nothing_is_claimed_before_setup_completes() {
    let dir = tempfile::tempdir().unwrap();
    let mut demo = Demo::new("sleep", dir.path());
    demo.setup_seconds = 1.5;
    let queue = Arc::new(MemoryQueue::new());
    for i in 0..3 {
        queue.push(entry(&format!("p{i}"), json!({"sleep_time": 1.0}), "resp"));
    }
    let running = demo.spawn(queue.clone());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(queue.pending_count(), 0);
    assert_eq!(queue.waiting_count(), 3);

    wait_for(Duration::from_secs(20), || queue.pending_count() == 1).await;
    assert_eq!(queue.waiting_count(), 2);

    wait_for(Duration::from_secs(20), || queue.acked().len() == 3).await;
    running.stop().await;
}

#[tokio::test]
async fn crash_fails_prediction_and_restarts_worker() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(MemoryQueue::new());
    let running = Demo::new("crash", dir.path()).spawn(queue.clone());

    queue.push(entry("c1", json!({}), "c1"));
    queue.push(entry("c2", json!({}), "c2"));
    wait_for(Duration::from_secs(30), || queue.acked().len() == 2).await;
    running.stop().await;

    for key in ["c1", "c2"] {
        let snapshots = responses(&queue, key);
        assert_well_formed(&snapshots);
        let last = snapshots.last().unwrap();
        assert_eq!(last["status"], "failed");
        assert_eq!(last["error"], "prediction failed");
        assert_eq!(last["logs"], json!(["about to crash"]));
    }
}

#[tokio::test]
async fn worker_that_exits_while_idle_is_replaced_before_claiming() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(MemoryQueue::new());
    let running = Demo::new("idle_exit", dir.path()).spawn(queue.clone());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    queue.push(entry("i1", json!({}), "i1"));
    wait_for(Duration::from_secs(30), || queue.acked().len() == 1).await;
    running.stop().await;

    let snapshots = responses(&queue, "i1");
    assert_well_formed(&snapshots);
    let last = snapshots.last().unwrap();
    assert_eq!(last["status"], "succeeded");
    assert_eq!(last["output"], "still here");
}

#[tokio::test]
async fn failed_restart_stops_the_consumer_without_claiming() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(MemoryQueue::new());
    let running = Demo::new("idle_exit_then_broken", dir.path()).spawn(queue.clone());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    queue.push(entry("b1", json!({}), "b1"));
    let err = tokio::time::timeout(Duration::from_secs(30), running.task)
        .await
        .expect("consumer did not stop")
        .unwrap()
        .unwrap_err();

    assert!(matches!(
        err,
        ConsumerError::Runner(RunnerError::SetupFailed(_))
    ));
    assert_eq!(queue.waiting_count(), 1);
    assert_eq!(queue.pending_count(), 0);
    assert!(queue.responses("b1").is_empty());
}

#[tokio::test]
async fn unresponsive_worker_is_killed_after_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut demo = Demo::new("ignores_cancel", dir.path());
    demo.timeout = Some(Duration::from_millis(500));
    demo.cancel_grace = Duration::from_millis(200);
    let queue = Arc::new(MemoryQueue::new());
    let running = demo.spawn(queue.clone());

    queue.push(entry("s1", json!({}), "s1"));
    queue.push(entry("s2", json!({}), "s2"));
    wait_for(Duration::from_secs(30), || queue.acked().len() == 2).await;
    running.stop().await;

    for key in ["s1", "s2"] {
        let last = responses(&queue, key).pop().unwrap();
        assert_eq!(last["status"], "failed");
        assert_eq!(last["error"], "Prediction timed out");
    }
}

#[tokio::test]
async fn shutdown_cancels_in_flight_prediction() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(MemoryQueue::new());
    let running = Demo::new("sleep", dir.path()).spawn(queue.clone());

    let message_id = queue.push(entry("long", json!({"sleep_time": 60.0}), "resp"));
    wait_for(Duration::from_secs(20), || !queue.responses("resp").is_empty()).await;
    running.stop().await;

    let snapshots = responses(&queue, "resp");
    assert_well_formed(&snapshots);
    assert_eq!(snapshots.last().unwrap()["status"], "canceled");
    assert_eq!(queue.acked(), vec![message_id]);
}

#[tokio::test]
async fn malformed_entries_are_acknowledged_and_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(MemoryQueue::new());
    let running = Demo::new("yielding", dir.path()).spawn(queue.clone());

    let bad = queue.push("not json");
    let missing_id = queue.push(r#"{"input": {}}"#);
    let good = queue.push(entry("ok", json!({}), "resp"));
    wait_for(Duration::from_secs(20), || queue.acked().len() == 3).await;
    running.stop().await;

    assert_eq!(queue.acked(), vec![bad, missing_id, good]);
    assert_eq!(
        responses(&queue, "resp").last().unwrap()["status"],
        "succeeded"
    );
}

#[tokio::test]
async fn failed_terminal_delivery_leaves_entry_pending() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut demo = Demo::new("yielding", dir.path());
    demo.webhook = WebhookConfig {
        max_retries: 1,
        backoff_base: Duration::from_millis(5),
        auth_token: None,
        ..WebhookConfig::default()
    };
    let queue = Arc::new(MemoryQueue::new());
    let running = demo.spawn(queue.clone());

    queue.push(
        json!({"id": "w1", "input": {}, "webhook": format!("{}/webhook", server.uri())})
            .to_string(),
    );
    wait_for(Duration::from_secs(20), || queue.waiting_count() == 0).await;

    // Terminal attempt plus one retry, after the intermediate ones.
    let mut terminal_attempts = 0;
    for _ in 0..200 {
        terminal_attempts = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| {
                serde_json::from_slice::<Value>(&r.body).unwrap()["status"] == "succeeded"
            })
            .count();
        if terminal_attempts == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(terminal_attempts, 2);
    running.stop().await;

    assert!(queue.acked().is_empty());
    assert_eq!(queue.pending_count(), 1);
}

#[tokio::test]
async fn undeliverable_entry_does_not_block_the_queue_and_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let webhook = WebhookConfig {
        max_retries: 0,
        backoff_base: Duration::from_millis(5),
        auth_token: None,
        ..WebhookConfig::default()
    };
    let mut demo = Demo::new("yielding", dir.path());
    demo.webhook = webhook.clone();
    let queue = Arc::new(MemoryQueue::new());
    let running = demo.spawn(queue.clone());

    let stuck = queue.push(
        json!({"id": "w1", "input": {}, "webhook": format!("{}/webhook", server.uri())})
            .to_string(),
    );
    let next = queue.push(entry("ok", json!({}), "resp"));
    wait_for(Duration::from_secs(20), || queue.acked().len() == 1).await;
    running.stop().await;

    assert_eq!(queue.acked(), vec![next.clone()]);
    assert_eq!(queue.pending_count(), 1);

    // The receiver comes back and a fresh consumer picks the entry up again.
    server.reset().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    assert_eq!(queue.recover(), 1);

    let mut demo = Demo::new("yielding", dir.path());
    demo.webhook = webhook;
    let running = demo.spawn(queue.clone());
    wait_for(Duration::from_secs(20), || queue.acked().len() == 2).await;
    running.stop().await;

    assert_eq!(queue.acked(), vec![next, stuck]);
    assert_eq!(queue.pending_count(), 0);
    let terminal = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| serde_json::from_slice::<Value>(&r.body).unwrap()["status"] == "succeeded")
        .count();
    assert_eq!(terminal, 1);
}
