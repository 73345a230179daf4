//! End-to-end tests over real sockets: an axum server, websocket agents and
//! clients, and a local TCP echo target behind the agent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;

use callback::api::{create_router, ApiSettings};
use callback::carrier::{self, Carrier};
use callback::connman::{ConnectionManager, ManagerSettings};
use callback::mux::MuxServer;
use callback::proxy;

async fn start_server() -> (SocketAddr, Arc<ConnectionManager>) {
    let connman = ConnectionManager::new(ManagerSettings {
        proxy_buffer_size: 1024,
        open_timeout: Duration::from_secs(2),
    });
    let settings = ApiSettings {
        connman: Arc::clone(&connman),
        context_path: String::new(),
        local_networks: Arc::new(Vec::new()),
        subscriber_buffer: 8,
        read_buffer_size: 1024,
        write_buffer_size: 1024,
    };
    let router = create_router(settings);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, connman)
}

async fn start_echo_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// Runs an in-process agent: websocket registration plus a mux server role
/// that forwards each accepted stream to `target`.
async fn start_agent(server: SocketAddr, id: &str, target: SocketAddr) -> CancellationToken {
    let url = format!("ws://{server}/api/v1/callback/{id}");
    let (socket, _) = connect_async(&url).await.expect("agent connect failed");
    let Carrier { stream, done: _ } = carrier::wrap_websocket(socket);
    let mut mux = MuxServer::new(stream);
    let shutdown = CancellationToken::new();
    let guard = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = guard.cancelled() => {
                    mux.close().await;
                    break;
                }
                accepted = mux.accept() => {
                    let Some(stream) = accepted else { break };
                    tokio::spawn(async move {
                        let Ok(outgoing) = TcpStream::connect(target).await else { return };
                        let _ = proxy::run(
                            1024,
                            stream,
                            outgoing,
                            CancellationToken::new(),
                            None,
                            None,
                        )
                        .await;
                    });
                }
            }
        }
    });
    shutdown
}

/// Opens a client websocket to `id` and returns the bridged byte stream.
async fn connect_client(server: SocketAddr, id: &str) -> DuplexStream {
    let url = format!("ws://{server}/api/v1/connect/{id}");
    let (socket, _) = connect_async(&url).await.expect("client connect failed");
    carrier::wrap_websocket(socket).stream
}

async fn fetch_json(url: String) -> serde_json::Value {
    reqwest::get(url)
        .await
        .expect("request failed")
        .json()
        .await
        .expect("invalid JSON")
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn register_list_and_echo_through_two_clients() {
    let (server, _connman) = start_server().await;
    let target = start_echo_target().await;
    let _agent = start_agent(server, "alpha", target).await;

    let list_url = format!("http://{server}/api/v1/callback");
    wait_until(|| {
        let url = list_url.clone();
        async move {
            let list = fetch_json(url).await;
            list["sessions"].get("alpha").is_some()
        }
    })
    .await;

    let list = fetch_json(list_url.clone()).await;
    assert_eq!(list["sessions"]["alpha"]["callback_id"], "alpha");
    assert_eq!(list["sessions"]["alpha"]["num_clients"], 0);
    assert!(list["sequence_num"].as_u64().unwrap() >= 1);

    let mut first = connect_client(server, "alpha").await;
    let mut second = connect_client(server, "alpha").await;

    first.write_all(b"ping-1").await.unwrap();
    second.write_all(b"ping-2").await.unwrap();

    let mut buf = [0u8; 6];
    first.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping-1");
    second.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping-2");

    // Both clients are live and fully accounted.
    wait_until(|| {
        let url = list_url.clone();
        async move {
            let list = fetch_json(url).await;
            list["sessions"]["alpha"]["num_clients"] == 2
        }
    })
    .await;

    let clients_url = format!("http://{server}/api/v1/connect");
    wait_until(|| {
        let url = clients_url.clone();
        async move {
            let list = fetch_json(url).await;
            let sessions = list["sessions"].as_array().cloned().unwrap_or_default();
            sessions.len() == 2
                && sessions
                    .iter()
                    .all(|s| s["bytes_in"] == 6 && s["bytes_out"] == 6)
        }
    })
    .await;

    drop(first);
    drop(second);

    wait_until(|| {
        let url = list_url.clone();
        async move {
            let list = fetch_json(url).await;
            list["sessions"]["alpha"]["num_clients"] == 0
        }
    })
    .await;
}

#[tokio::test]
async fn duplicate_registration_is_refused() {
    let (server, _connman) = start_server().await;
    let target = start_echo_target().await;
    let _agent = start_agent(server, "alpha", target).await;

    let list_url = format!("http://{server}/api/v1/callback");
    wait_until(|| {
        let url = list_url.clone();
        async move {
            let list = fetch_json(url).await;
            list["sessions"].get("alpha").is_some()
        }
    })
    .await;

    let url = format!("ws://{server}/api/v1/callback/alpha");
    let refused = connect_async(&url).await;
    assert!(refused.is_err(), "duplicate registration was not refused");

    // The original session is unaffected.
    let list = fetch_json(list_url).await;
    assert!(list["sessions"].get("alpha").is_some());
}

#[tokio::test]
async fn unknown_id_is_rejected_without_side_effects() {
    let (server, connman) = start_server().await;

    let url = format!("ws://{server}/api/v1/connect/ghost");
    let refused = connect_async(&url).await;
    assert!(refused.is_err());

    let clients = connman.list_client_sessions().await;
    assert!(clients.sessions.is_empty());
    assert_eq!(clients.sequence_num, 0);
}

#[tokio::test]
async fn agent_disconnect_tears_down_clients() {
    let (server, connman) = start_server().await;
    let target = start_echo_target().await;
    let agent = start_agent(server, "alpha", target).await;

    let list_url = format!("http://{server}/api/v1/callback");
    wait_until(|| {
        let url = list_url.clone();
        async move {
            let list = fetch_json(url).await;
            list["sessions"].get("alpha").is_some()
        }
    })
    .await;

    let mut client = connect_client(server, "alpha").await;
    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    // Agent goes away mid-session.
    agent.cancel();

    let mut rest = Vec::new();
    let eof = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest)).await;
    assert!(eof.is_ok(), "client stream did not end after agent loss");

    wait_until(|| {
        let connman = Arc::clone(&connman);
        async move {
            connman.list_callback_sessions().await.sessions.is_empty()
                && connman.list_client_sessions().await.sessions.is_empty()
        }
    })
    .await;
}
