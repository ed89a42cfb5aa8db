//! Messenger session tests: handshake, action timeouts, and the latency
//! buffer's deadline widening.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use slice_worker::messenger::{ControllerMessenger, MessengerConfig, WorkerMessenger};
use slice_worker::slice::Slice;
use slice_worker::WorkerError;
use uuid::Uuid;

fn config(action_ms: u64, buffer_ms: u64) -> MessengerConfig {
    MessengerConfig {
        action_timeout: Duration::from_millis(action_ms),
        network_latency_buffer: Duration::from_millis(buffer_ms),
    }
}

/// Hand-rolled controller endpoint that answers the handshake and then
/// acks slice completions after `ack_delay`, or never when `None`.
async fn stub_controller(ack_delay: Option<Duration>) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        let frame = framed.next().await.unwrap().unwrap();
        let message: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(message["type"], "handshake");
        framed
            .send(Bytes::from(
                serde_json::to_vec(&json!({ "type": "handshake_ack" })).unwrap(),
            ))
            .await
            .unwrap();

        while let Some(Ok(frame)) = framed.next().await {
            let message: Value = serde_json::from_slice(&frame).unwrap();
            if message["type"] == "slice_complete" {
                let Some(delay) = ack_delay else { continue };
                tokio::time::sleep(delay).await;
                let ack = json!({
                    "type": "slice_complete_ack",
                    "slice_id": message["slice"]["slice_id"],
                });
                framed
                    .send(Bytes::from(serde_json::to_vec(&ack).unwrap()))
                    .await
                    .unwrap();
            }
        }
    });

    (addr, handle)
}

#[tokio::test]
async fn worker_and_controller_exchange_slices_end_to_end() {
    let controller = ControllerMessenger::bind("127.0.0.1:0", config(1000, 0))
        .await
        .unwrap();
    let addr = controller.local_addr().to_string();

    let worker = WorkerMessenger::connect(&addr, "host__1", config(1000, 0))
        .await
        .unwrap();
    controller
        .wait_for_worker("host__1", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(controller.connected_workers().await, vec!["host__1"]);

    let slice = Slice::new(json!({ "from": 0, "size": 100 }));
    controller.send_new_slice("host__1", &slice).await.unwrap();

    let assigned = worker.wait_for_slice().await.unwrap();
    assert_eq!(assigned, slice);

    worker
        .send_slice_complete(&assigned, None, None)
        .await
        .unwrap();
    let completion = controller.on_slice_complete("host__1", None).await.unwrap();
    assert_eq!(completion.worker_id, "host__1");
    assert_eq!(completion.slice.slice_id, slice.slice_id);
    assert!(completion.error.is_none());

    worker.close().await;
    controller.close().await;
}

#[tokio::test]
async fn dispatching_to_an_unknown_worker_fails() {
    let controller = ControllerMessenger::bind("127.0.0.1:0", config(1000, 0))
        .await
        .unwrap();
    let err = controller
        .send_new_slice("nobody__1", &Slice::new(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Connection(_)));
    controller.close().await;
}

#[tokio::test]
async fn connecting_to_a_dead_controller_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let err = WorkerMessenger::connect(&addr, "host__1", config(200, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Connection(_)));
}

#[tokio::test]
async fn an_unacknowledged_action_times_out() {
    let (addr, stub) = stub_controller(None).await;
    let worker = WorkerMessenger::connect(&addr.to_string(), "host__1", config(200, 0))
        .await
        .unwrap();

    let err = worker
        .send_slice_complete(&Slice::new(json!({})), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::ActionTimeout(200)));

    worker.close().await;
    stub.abort();
}

/// Controller endpoint that answers slice completions only with acks for
/// unrelated slice ids, one every 100ms.
async fn stale_acking_controller() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        let frame = framed.next().await.unwrap().unwrap();
        let message: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(message["type"], "handshake");
        framed
            .send(Bytes::from(
                serde_json::to_vec(&json!({ "type": "handshake_ack" })).unwrap(),
            ))
            .await
            .unwrap();

        let frame = framed.next().await.unwrap().unwrap();
        let message: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(message["type"], "slice_complete");
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let ack = json!({
                "type": "slice_complete_ack",
                "slice_id": Uuid::new_v4(),
            });
            if framed
                .send(Bytes::from(serde_json::to_vec(&ack).unwrap()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    (addr, handle)
}

#[tokio::test]
async fn stale_acks_do_not_extend_the_action_deadline() {
    let (addr, stub) = stale_acking_controller().await;
    let worker = WorkerMessenger::connect(&addr.to_string(), "host__1", config(300, 0))
        .await
        .unwrap();

    // A steady stream of mismatched acks must spend the deadline, not
    // keep resetting it.
    let started = std::time::Instant::now();
    let err = worker
        .send_slice_complete(&Slice::new(json!({})), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::ActionTimeout(300)));
    assert!(started.elapsed() < Duration::from_millis(900));

    worker.close().await;
    stub.abort();
}

#[tokio::test]
async fn the_latency_buffer_widens_the_deadline() {
    // The ack arrives after the action timeout alone would have expired,
    // but inside the buffered deadline.
    let (addr, stub) = stub_controller(Some(Duration::from_millis(300))).await;
    let worker = WorkerMessenger::connect(&addr.to_string(), "host__1", config(200, 400))
        .await
        .unwrap();

    worker
        .send_slice_complete(&Slice::new(json!({})), None, None)
        .await
        .unwrap();

    worker.close().await;
    stub.abort();
}

#[tokio::test]
async fn waiting_on_a_closed_session_reports_a_connection_error() {
    let controller = ControllerMessenger::bind("127.0.0.1:0", config(1000, 0))
        .await
        .unwrap();
    let worker = WorkerMessenger::connect(&controller.local_addr().to_string(), "host__1", config(1000, 0))
        .await
        .unwrap();

    worker.close().await;
    let err = worker.wait_for_slice().await.unwrap_err();
    assert!(matches!(err, WorkerError::Connection(_)));

    controller.close().await;
}
