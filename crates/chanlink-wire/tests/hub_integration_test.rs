//! Integration tests for hub-to-hub traffic.
//!
//! Each test starts real hubs on loopback ports chosen by the OS and drives
//! them through the public API only.

use bytes::Bytes;
use chanlink_wire::message::IMAGE;
use chanlink_wire::{
    Direction, Hub, HubConfig, Selector, TransportConfig, WireError, WireFormat,
};
use std::future::Future;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn hub_config(transport: TransportConfig) -> HubConfig {
    HubConfig {
        host: "127.0.0.1".to_string(),
        port: Some(0),
        transport: TransportConfig {
            io_timeout_ms: 200,
            ..transport
        },
        ..HubConfig::default()
    }
}

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(WAIT, fut).await.expect("timed out")
}

/// `origin` dials `target` `count` times, all under the same name.
async fn link(origin: &Hub, target: &Hub, name: &str, count: usize) {
    for _ in 0..count {
        origin
            .connect(name, "127.0.0.1", target.port())
            .await
            .unwrap();
    }
    let accepted = within(target.wait_for_transport_count(count)).await.unwrap();
    for transport in accepted {
        within(transport.wait_for_name()).await.unwrap();
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_write_all_reaches_every_connection() {
    let h1 = Hub::start(hub_config(TransportConfig::default())).await.unwrap();
    let h2 = Hub::start(hub_config(TransportConfig::default())).await.unwrap();
    link(&h1, &h2, "x", 3).await;

    let errors = h1.write_all("chan", "hello").await;
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");

    let (values, errors) = within(h2.wait_for_get_all("chan")).await;
    assert!(errors.is_empty());
    assert_eq!(values, vec![Bytes::from_static(b"hello"); 3]);
    assert_eq!(h2.get_by_name("x", "chan").len(), 3);
    assert!(h2.get_by_name("y", "chan").is_empty());

    h1.close().await;
    h2.close().await;
}

#[tokio::test]
async fn test_fan_out_collects_per_transport_errors() {
    let h1 = Hub::start(hub_config(TransportConfig::default())).await.unwrap();
    let h2 = Hub::start(hub_config(TransportConfig::default())).await.unwrap();
    link(&h1, &h2, "x", 2).await;

    let errors = h1.write_all("__ack", "forged").await;
    assert_eq!(errors.len(), 2);
    for (addr, error) in &errors {
        assert_eq!(addr.port(), h2.port());
        assert!(matches!(error, WireError::InvalidChannel { .. }));
    }

    h1.close().await;
    h2.close().await;
}

#[tokio::test]
async fn test_fan_out_skips_closed_transports() {
    let h1 = Hub::start(hub_config(TransportConfig::default())).await.unwrap();
    let h2 = Hub::start(hub_config(TransportConfig::default())).await.unwrap();
    link(&h1, &h2, "x", 3).await;

    h1.write_all("before", "1").await;
    assert_eq!(within(h2.wait_for_get_all("before")).await.0.len(), 3);

    h1.transports()[0].close().await;
    eventually(|| h2.select(Selector::All).len() == 2).await;

    let errors = h1.write_all("after", "2").await;
    assert!(errors.is_empty());
    assert_eq!(within(h2.wait_for_get_all("after")).await.0.len(), 2);
    // The closed connection keeps its last value.
    assert_eq!(h2.get_all("before").len(), 3);
    assert_eq!(h2.transport_count(), 3);

    h1.close().await;
    h2.close().await;
}

#[tokio::test]
async fn test_directional_writes_and_reads() {
    let h1 = Hub::start(hub_config(TransportConfig::default())).await.unwrap();
    let h2 = Hub::start(hub_config(TransportConfig::default())).await.unwrap();
    link(&h1, &h2, "scout", 1).await;

    assert!(h2.write_to_local("cmd", "ignored").await.is_empty());
    assert!(h2.write_to_remote("cmd", "go").await.is_empty());

    let outbound = h1.transports().remove(0);
    assert_eq!(outbound.direction(), Some(Direction::Local));
    assert_eq!(within(outbound.wait_for_channel("cmd")).await.unwrap(), "go");
    assert_eq!(h1.get_local("cmd"), vec![Bytes::from_static(b"go")]);
    assert!(h1.get_remote("cmd").is_empty());

    h1.write_to_local("reply", "ok").await;
    let inbound = h2.transports().remove(0);
    assert_eq!(inbound.direction(), Some(Direction::Remote));
    assert_eq!(within(inbound.wait_for_channel("reply")).await.unwrap(), "ok");
    assert_eq!(h2.get_remote("reply").len(), 1);

    h1.close().await;
    h2.close().await;
}

#[tokio::test]
async fn test_image_fan_out() {
    let h1 = Hub::start(hub_config(TransportConfig::default())).await.unwrap();
    let h2 = Hub::start(hub_config(TransportConfig::default())).await.unwrap();
    link(&h1, &h2, "cam", 2).await;

    let frame = Bytes::from((0..=255u8).cycle().take(50_000).collect::<Vec<u8>>());
    assert!(h1.write_image_all(frame.clone()).await.is_empty());
    assert!(within(h1.wait_for_all_ready()).await.is_empty());
    assert!(h1.can_write_all());

    for transport in h2.transports() {
        within(transport.wait_for_channel(IMAGE)).await.unwrap();
    }
    assert_eq!(h2.get_image_all(), vec![frame.clone(), frame]);

    h1.close().await;
    h2.close().await;
}

#[tokio::test]
async fn test_oversized_image_fails_without_blocking_fan_out() {
    let transport = TransportConfig {
        max_frame_bytes: 64 * 1024,
        ..TransportConfig::default()
    };
    let h1 = Hub::start(hub_config(transport.clone())).await.unwrap();
    let h2 = Hub::start(hub_config(transport)).await.unwrap();
    link(&h1, &h2, "cam", 2).await;

    let oversized = Bytes::from(vec![0x55u8; 64 * 1024 + 1]);
    let errors = h1.write_image_all(oversized).await;
    assert_eq!(errors.len(), 2);
    for (_, error) in &errors {
        assert!(matches!(error, WireError::MessageTooLarge { .. }));
    }
    assert!(h1.can_write_all());

    let frame = Bytes::from(vec![0x55u8; 1024]);
    assert!(h1.write_image_all(frame.clone()).await.is_empty());
    assert!(within(h1.wait_for_all_ready()).await.is_empty());
    for transport in h2.transports() {
        assert_eq!(within(transport.wait_for_channel(IMAGE)).await.unwrap(), frame);
    }

    h1.close().await;
    h2.close().await;
}

// ---------------------------------------------------------------------------
// Flow control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_acknowledged_buffered_stream_keeps_order() {
    let transport = TransportConfig {
        require_ack: true,
        buffer_enabled: true,
        ..TransportConfig::default()
    };
    let h1 = Hub::start(hub_config(transport.clone())).await.unwrap();
    let h2 = Hub::start(hub_config(transport)).await.unwrap();
    link(&h1, &h2, "seq", 1).await;

    let receiver = h2.transports().remove(0);
    let mut events = receiver.subscribe();

    for i in 0..10 {
        assert!(h1.write_all("n", i.to_string()).await.is_empty());
    }
    assert!(within(h1.wait_for_all_ready()).await.is_empty());

    let mut seen = Vec::new();
    within(async {
        while seen.len() < 10 {
            if let chanlink_wire::TransportEvent::Message { channel, data } =
                events.recv().await.unwrap()
            {
                if channel == "n" {
                    seen.push(String::from_utf8(data.to_vec()).unwrap());
                }
            }
        }
    })
    .await;
    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    assert_eq!(seen, expected);

    h1.close().await;
    h2.close().await;
}

#[tokio::test]
async fn test_write_when_ready_fan_out() {
    let transport = TransportConfig {
        require_ack: true,
        ..TransportConfig::default()
    };
    let h1 = Hub::start(hub_config(transport.clone())).await.unwrap();
    let h2 = Hub::start(hub_config(transport)).await.unwrap();
    link(&h1, &h2, "w", 2).await;

    for i in 0..5 {
        let errors = within(h1.write_all_when_ready("tick", i.to_string())).await;
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }
    assert!(within(h1.write_to_name_when_ready("w", "done", "yes"))
        .await
        .is_empty());
    assert_eq!(within(h2.wait_for_get_all("done")).await.0.len(), 2);
    assert_eq!(h2.get_all("tick"), vec![Bytes::from_static(b"4"); 2]);

    h1.close().await;
    h2.close().await;
}

// ---------------------------------------------------------------------------
// Formats
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_json_lines_with_compression() {
    let transport = TransportConfig {
        compression: true,
        wire_format: WireFormat::JsonLines,
        ..TransportConfig::default()
    };
    let h1 = Hub::start(hub_config(transport.clone())).await.unwrap();
    let h2 = Hub::start(hub_config(transport)).await.unwrap();
    link(&h1, &h2, "legacy", 1).await;

    let payload = Bytes::from_static(b"\x00\x00\x00\x01\n\xff binary");
    h1.write_all("raw", payload.clone()).await;
    h1.write_all("text", "plain").await;

    assert_eq!(within(h2.wait_for_get_all("raw")).await.0, vec![payload]);
    assert_eq!(
        within(h2.wait_for_get_all("text")).await.0,
        vec![Bytes::from_static(b"plain")]
    );

    h1.close().await;
    h2.close().await;
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_hub_close_propagates_to_peer_transports() {
    let h1 = Hub::start(hub_config(TransportConfig::default())).await.unwrap();
    let h2 = Hub::start(hub_config(TransportConfig::default())).await.unwrap();
    link(&h1, &h2, "x", 2).await;

    h1.close().await;
    for transport in h2.transports() {
        assert!(transport.wait_for_close_timeout(WAIT).await);
        assert!(transport.is_stopped());
    }
    assert!(h2.select(Selector::All).is_empty());
    assert!(h2.is_open());

    h2.close().await;
    assert!(h2.is_stopped());
}

#[tokio::test]
async fn test_connect_retries_until_hub_appears() {
    let placeholder = Hub::start(hub_config(TransportConfig::default())).await.unwrap();
    let port = placeholder.port();
    placeholder.close().await;

    let h1 = Hub::start(hub_config(TransportConfig::default())).await.unwrap();
    let dialer = {
        let h1 = h1.clone();
        tokio::spawn(async move { h1.connect("late", "127.0.0.1", port).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let h2 = Hub::start(HubConfig {
        port: Some(port),
        ..hub_config(TransportConfig::default())
    })
    .await
    .unwrap();

    let transport = within(dialer).await.unwrap().unwrap();
    assert!(transport.is_open());
    let accepted = within(h2.wait_for_transport()).await.unwrap();
    assert_eq!(within(accepted.wait_for_name()).await.unwrap(), "late");

    h1.close().await;
    h2.close().await;
}
