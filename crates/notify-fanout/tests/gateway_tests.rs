//! End-to-end tests: publish through the broker, deliver to connections

use futures::{SinkExt, StreamExt};
use notify_fanout::auth::trusted_headers;
use notify_fanout::{
    ChannelRouter, Connection, Gateway, GatewayLimits, MemoryBroker, NotificationMessage, Payload,
    PubSubTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

const WAIT: Duration = Duration::from_secs(2);

fn gateway(broker: &MemoryBroker) -> Gateway {
    Gateway::builder()
        .broker(broker.clone())
        .channel_prefix("test")
        .instance_id("gateway-test")
        .worker_pool_size(2)
        .shutdown_timeout(Duration::from_secs(5))
        .identity_resolver(trusted_headers())
        .build()
        .unwrap()
}

async fn connect(gateway: &Gateway, user_id: &str, role: &str) -> mpsc::Receiver<Payload> {
    let (connection, receiver) = Connection::new(user_id, role, 16);
    assert!(gateway.connection_manager().register(connection).await);
    receiver
}

async fn expect_payload(receiver: &mut mpsc::Receiver<Payload>) -> NotificationMessage {
    let payload = timeout(WAIT, receiver.recv())
        .await
        .expect("payload delivered in time")
        .expect("connection open");
    NotificationMessage::from_json(&payload).unwrap()
}

async fn expect_nothing(receiver: &mut mpsc::Receiver<Payload>) {
    assert!(timeout(Duration::from_millis(150), receiver.recv()).await.is_err());
}

// ============== Fan-out Scenarios ==============

#[tokio::test]
async fn test_publish_reaches_only_the_target_user() {
    let broker = MemoryBroker::new();
    let gateway = gateway(&broker);
    gateway.start().await.unwrap();

    let mut user_42_a = connect(&gateway, "42", "member").await;
    let mut user_42_b = connect(&gateway, "42", "member").await;
    let mut user_7 = connect(&gateway, "7", "member").await;

    let router = ChannelRouter::with_prefix("test");
    let publisher = PubSubTransport::new(broker.clone());
    let message = NotificationMessage::new("42", "order_shipped", "Shipped", "Order 1001 shipped")
        .with_data("order_id", serde_json::json!(1001));
    publisher.publish(&router.user_channel("42"), &message).await.unwrap();

    assert_eq!(expect_payload(&mut user_42_a).await, message);
    assert_eq!(expect_payload(&mut user_42_b).await, message);
    expect_nothing(&mut user_7).await;

    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_role_and_system_routing() {
    let broker = MemoryBroker::new();
    let gateway = gateway(&broker);
    gateway.start().await.unwrap();

    let mut admin = connect(&gateway, "1", "admin").await;
    let mut member = connect(&gateway, "2", "member").await;

    let router = gateway.channel_router().clone();
    let publisher = PubSubTransport::new(broker.clone());

    let to_admins = NotificationMessage::new("1", "audit", "Audit", "Weekly audit ready");
    publisher.publish(&router.role_channel("admin"), &to_admins).await.unwrap();
    assert_eq!(expect_payload(&mut admin).await.id, to_admins.id);
    expect_nothing(&mut member).await;

    let to_all = NotificationMessage::new("system", "maintenance", "Maintenance", "Down at 02:00");
    publisher.publish(&router.system_channel(), &to_all).await.unwrap();
    assert_eq!(expect_payload(&mut admin).await.id, to_all.id);
    assert_eq!(expect_payload(&mut member).await.id, to_all.id);

    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expired_and_malformed_notifications_are_dropped() {
    let broker = MemoryBroker::new();
    let gateway = gateway(&broker);
    gateway.start().await.unwrap();
    let mut receiver = connect(&gateway, "42", "").await;

    let router = gateway.channel_router().clone();
    let publisher = PubSubTransport::new(broker.clone());
    let expired = NotificationMessage::new("42", "promo", "Sale", "Ended yesterday")
        .with_expiry(chrono::Utc::now() - chrono::Duration::hours(1));
    publisher.publish(&router.user_channel("42"), &expired).await.unwrap();
    publisher.publish_raw(&router.user_channel("42"), "not json").await.unwrap();
    expect_nothing(&mut receiver).await;

    let failed = timeout(WAIT, async {
        while gateway.dispatcher().stats().failed == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(failed.is_ok());

    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_with_live_connections_and_in_flight_messages() {
    let broker = MemoryBroker::new();
    let gateway = gateway(&broker);
    gateway.start().await.unwrap();

    let mut receivers = Vec::new();
    for i in 0..5 {
        receivers.push(connect(&gateway, &format!("user-{i}"), "member").await);
    }

    let router = gateway.channel_router().clone();
    let publisher = PubSubTransport::new(broker.clone());
    for i in 0..2 {
        let message = NotificationMessage::new("user-0", "ping", "Ping", format!("in flight {i}"));
        publisher.publish(&router.system_channel(), &message).await.unwrap();
    }

    timeout(Duration::from_secs(5), gateway.shutdown())
        .await
        .expect("shutdown within timeout")
        .unwrap();

    assert!(gateway.is_draining());
    assert!(!gateway.transport().is_active().await);
    assert_eq!(gateway.connection_manager().connection_count(), 0);

    // Every buffer is closed, after at most the two in-flight payloads
    for mut receiver in receivers {
        let drained = timeout(WAIT, async {
            let mut seen = 0;
            while receiver.recv().await.is_some() {
                seen += 1;
            }
            seen
        })
        .await
        .unwrap();
        assert!(drained <= 2);
    }

    // Publishing after shutdown is harmless
    publisher.publish_raw(&router.system_channel(), "{}").await.unwrap();
    gateway.shutdown().await.unwrap();
}

// ============== WebSocket Gateway ==============

struct Running {
    gateway: Arc<Gateway>,
    addr: std::net::SocketAddr,
    stop: oneshot::Sender<()>,
    server: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    async fn stop(self) {
        let _ = self.stop.send(());
        timeout(Duration::from_secs(10), self.server)
            .await
            .expect("gateway stopped in time")
            .unwrap()
            .unwrap();
    }
}

async fn serve(broker: &MemoryBroker, limits: GatewayLimits) -> Running {
    let gateway = Arc::new(
        Gateway::builder()
            .broker(broker.clone())
            .limits(limits)
            .shutdown_timeout(Duration::from_secs(5))
            .identity_resolver(trusted_headers())
            .build()
            .unwrap(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();

    let server = tokio::spawn({
        let gateway = gateway.clone();
        async move {
            gateway
                .run_until(listener, async {
                    let _ = stopped.await;
                })
                .await
        }
    });

    timeout(WAIT, async {
        while !gateway.transport().is_active().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("gateway subscribed");

    Running {
        gateway,
        addr,
        stop,
        server,
    }
}

fn ws_request(
    addr: std::net::SocketAddr,
    headers: &[(&'static str, &'static str)],
) -> tokio_tungstenite::tungstenite::handshake::client::Request {
    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    for (name, value) in headers {
        request
            .headers_mut()
            .insert(*name, HeaderValue::from_static(*value));
    }
    request
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_websocket_client_receives_its_notifications() {
    let broker = MemoryBroker::new();
    let running = serve(&broker, GatewayLimits::default()).await;

    let request = ws_request(running.addr, &[("x-user-id", "42"), ("x-user-role", "member")]);
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let manager = running.gateway.connection_manager().clone();
    timeout(WAIT, async {
        while manager.user_connection_count("42").await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection registered");

    let router = ChannelRouter::new();
    let publisher = PubSubTransport::new(broker.clone());
    let message = NotificationMessage::new("42", "order_shipped", "Shipped", "Order 1001 shipped");
    publisher.publish(&router.user_channel("42"), &message).await.unwrap();

    let frame = timeout(WAIT, socket.next()).await.unwrap().unwrap().unwrap();
    let received = NotificationMessage::from_json(frame.to_text().unwrap()).unwrap();
    assert_eq!(received, message);

    let health = http_get(running.addr, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.contains(r#""status":"ok""#));
    assert!(health.contains(r#""active_connections":1"#));
    assert!(health.contains(r#""pubsub_active":true"#));

    let metrics = http_get(running.addr, "/metrics").await;
    assert!(metrics.contains("text/plain; version=0.0.4"));
    assert!(metrics.contains("connections_total 1"));
    assert!(metrics.contains("messages_sent_total 1"));

    socket.close(None).await.unwrap();
    timeout(WAIT, async {
        while manager.user_connection_count("42").await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection unregistered after close");

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upgrade_rejections() {
    let broker = MemoryBroker::new();
    let limits = GatewayLimits {
        allowed_origins: vec!["https://app.example.com".to_string()],
        ..GatewayLimits::default()
    };
    let running = serve(&broker, limits).await;

    let missing_identity = tokio_tungstenite::connect_async(ws_request(running.addr, &[])).await;
    match missing_identity {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
        Err(e) => panic!("expected 401, got {e}"),
        Ok(_) => panic!("expected 401, upgrade succeeded"),
    }

    let bad_origin = tokio_tungstenite::connect_async(ws_request(
        running.addr,
        &[("x-user-id", "42"), ("origin", "https://evil.example.com")],
    ))
    .await;
    match bad_origin {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 403),
        Err(e) => panic!("expected 403, got {e}"),
        Ok(_) => panic!("expected 403, upgrade succeeded"),
    }

    let good_origin = tokio_tungstenite::connect_async(ws_request(
        running.addr,
        &[("x-user-id", "42"), ("origin", "https://app.example.com")],
    ))
    .await;
    assert!(good_origin.is_ok());

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_limit_breach_closes_with_policy_code() {
    let broker = MemoryBroker::new();
    let limits = GatewayLimits {
        rate_limit_per_second: 1,
        rate_limit_burst: 1,
        ..GatewayLimits::default()
    };
    let running = serve(&broker, limits).await;

    let (mut socket, _) =
        tokio_tungstenite::connect_async(ws_request(running.addr, &[("x-user-id", "42")]))
            .await
            .unwrap();
    for _ in 0..3 {
        let _ = socket.send(Message::Text("hello".into())).await;
    }

    let close = timeout(WAIT, async {
        while let Some(frame) = socket.next().await {
            if let Ok(Message::Close(frame)) = frame {
                return frame;
            }
        }
        None
    })
    .await
    .unwrap()
    .expect("close frame");
    assert_eq!(close.code, CloseCode::Policy);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_frame_closes_with_size_code() {
    let broker = MemoryBroker::new();
    let limits = GatewayLimits {
        max_message_size: 64,
        ..GatewayLimits::default()
    };
    let running = serve(&broker, limits).await;

    let (mut socket, _) =
        tokio_tungstenite::connect_async(ws_request(running.addr, &[("x-user-id", "42")]))
            .await
            .unwrap();
    socket.send(Message::Text("a".repeat(64).into())).await.unwrap();
    socket.send(Message::Text("x".repeat(1000).into())).await.unwrap();

    let close = timeout(WAIT, async {
        while let Some(frame) = socket.next().await {
            if let Ok(Message::Close(frame)) = frame {
                return frame;
            }
        }
        None
    })
    .await
    .unwrap()
    .expect("close frame");
    assert_eq!(close.code, CloseCode::Size);

    let manager = running.gateway.connection_manager().clone();
    timeout(WAIT, async {
        while manager.user_connection_count("42").await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection unregistered after size violation");

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zero_ping_interval_still_serves_the_connection() {
    let broker = MemoryBroker::new();
    let limits = GatewayLimits {
        ping_interval: Duration::ZERO,
        ..GatewayLimits::default()
    };
    let running = serve(&broker, limits).await;

    let (mut socket, _) =
        tokio_tungstenite::connect_async(ws_request(running.addr, &[("x-user-id", "42")]))
            .await
            .unwrap();
    let manager = running.gateway.connection_manager().clone();
    timeout(WAIT, async {
        while manager.user_connection_count("42").await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection registered");

    let pinged = timeout(WAIT, async {
        while let Some(frame) = socket.next().await {
            if matches!(frame, Ok(Message::Ping(_))) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(pinged);

    let router = ChannelRouter::new();
    let publisher = PubSubTransport::new(broker.clone());
    let message = NotificationMessage::new("42", "digest", "Digest", "Your weekly digest");
    publisher.publish(&router.user_channel("42"), &message).await.unwrap();

    let received = timeout(WAIT, async {
        while let Some(frame) = socket.next().await {
            if let Ok(Message::Text(text)) = frame {
                return NotificationMessage::from_json(text.as_str()).ok();
            }
        }
        None
    })
    .await
    .unwrap()
    .expect("notification delivered");
    assert_eq!(received.id, message.id);

    socket.close(None).await.unwrap();
    timeout(WAIT, async {
        while manager.user_connection_count("42").await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection unregistered after close");

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_open_sockets() {
    let broker = MemoryBroker::new();
    let running = serve(&broker, GatewayLimits::default()).await;

    let (mut socket, _) =
        tokio_tungstenite::connect_async(ws_request(running.addr, &[("x-user-id", "42")]))
            .await
            .unwrap();
    let manager = running.gateway.connection_manager().clone();
    timeout(WAIT, async {
        while manager.user_connection_count("42").await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection registered");

    let gateway = running.gateway.clone();
    running.stop().await;
    assert!(gateway.is_draining());

    let closed = timeout(WAIT, async {
        while let Some(frame) = socket.next().await {
            if matches!(frame, Ok(Message::Close(_)) | Err(_)) {
                return true;
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(closed);
}
