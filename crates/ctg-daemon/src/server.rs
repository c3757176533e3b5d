//! Web server setup and routing

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::api;
use crate::config::TlsConfig;
use crate::observer_ws;
use crate::sensor_ws;
use crate::state::AppState;

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    // Bounds the upgrade handler (auth and the 101 response), not the upgraded socket
    let sockets = Router::new()
        .route("/ws/sensors", get(sensor_ws::sensor_handler))
        .route("/ws/observers", get(observer_ws::observer_handler))
        .layer(TimeoutLayer::new(state.config.sensors.handshake_timeout()));

    Router::new()
        .route("/api/health", get(api::health))
        .route("/api/status", get(api::status))
        .route("/api/sensors/start", post(api::start_sensor))
        .route("/api/sensors/stop", post(api::stop_sensors))
        .merge(sockets)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the web server (HTTP or HTTPS depending on config)
pub async fn run(state: Arc<AppState>, bind: &str, tls: Option<&TlsConfig>) -> Result<()> {
    // Keep the inference link up in the background
    let relay = state.relay.clone();
    tokio::spawn(async move {
        relay.run().await;
    });

    let app = router(state);

    if let Some(tls_config) = tls {
        run_https(app, bind, tls_config).await
    } else {
        run_http(app, bind).await
    }
}

/// Run plain HTTP server
async fn run_http(app: Router, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %bind, protocol = "HTTP", "Starting web server");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Run HTTPS server with TLS
async fn run_https(app: Router, bind: &str, tls: &TlsConfig) -> Result<()> {
    use axum_server::tls_rustls::RustlsConfig;
    use std::path::PathBuf;

    let cert_path = PathBuf::from(&tls.cert);
    let key_path = PathBuf::from(&tls.key);

    if !cert_path.exists() {
        anyhow::bail!("TLS certificate file not found: {}", tls.cert);
    }
    if !key_path.exists() {
        anyhow::bail!("TLS key file not found: {}", tls.key);
    }

    let rustls_config = RustlsConfig::from_pem_file(&cert_path, &key_path).await?;

    let addr: std::net::SocketAddr = bind.parse()?;
    info!(address = %bind, protocol = "HTTPS", cert = %tls.cert, "Starting web server with TLS");

    axum_server::bind_rustls(addr, rustls_config)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SensorEntity};
    use ctg_core::{ExamRepository, MemoryExamRepository};
    use futures_util::{SinkExt, StreamExt};
    use std::future::Future;
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::{self, Message};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const UNREACHABLE_INFERENCE: &str = "ws://127.0.0.1:9/ws/ctg";

    async fn eventually<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check().await {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn reading_json(secs: f64) -> String {
        format!(
            r#"{{"sensorID":"s1","secFromStart":{secs:?},"data":{{"BPMChild":140,"uterus":20,"spasms":0}}}}"#
        )
    }

    /// Inference peer replying `result:<secFromStart>` to every reading
    async fn spawn_inference_peer() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    while let Some(Ok(Message::Text(text))) = ws.next().await {
                        let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                        let reply = format!("result:{}", value["secFromStart"]);
                        if ws.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        format!("ws://{addr}/ws/ctg")
    }

    async fn boot(inference_url: &str) -> (SocketAddr, Arc<AppState>, Arc<MemoryExamRepository>) {
        boot_with(test_config(inference_url)).await
    }

    fn test_config(inference_url: &str) -> Config {
        let mut config = Config::default();
        config.sensors.entities = vec![
            SensorEntity {
                id: "s1".into(),
                token: "secret-1".into(),
                ip: None,
            },
            SensorEntity {
                id: "s2".into(),
                token: "secret-2".into(),
                ip: None,
            },
        ];
        config.inference.url = inference_url.to_string();
        config.inference.reconnect_backoff_secs = 1;
        config
    }

    async fn boot_with(config: Config) -> (SocketAddr, Arc<AppState>, Arc<MemoryExamRepository>) {
        let repo = Arc::new(MemoryExamRepository::with_retention(config.storage.retained_rows));
        let state = AppState::new(config, repo.clone()).unwrap();

        let relay = state.relay.clone();
        tokio::spawn(async move { relay.run().await });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (addr, state, repo)
    }

    async fn connect_sensor(
        addr: SocketAddr,
        sensor_id: Option<&str>,
        token: &str,
    ) -> Result<Client, tungstenite::Error> {
        let url = match sensor_id {
            Some(id) => format!("ws://{addr}/ws/sensors?sensor_id={id}"),
            None => format!("ws://{addr}/ws/sensors"),
        };
        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .insert("X-Auth-Sensor-Token", HeaderValue::from_str(token).unwrap());
        connect_async(request).await.map(|(ws, _)| ws)
    }

    fn rejected_status(result: Result<Client, tungstenite::Error>) -> u16 {
        match result {
            Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("connection should have been rejected"),
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_credentials_without_state_change() {
        let (addr, state, repo) = boot(UNREACHABLE_INFERENCE).await;

        assert_eq!(rejected_status(connect_sensor(addr, Some("s1"), "wrong").await), 401);
        assert_eq!(rejected_status(connect_sensor(addr, Some("s9"), "secret-1").await), 403);
        assert_eq!(rejected_status(connect_sensor(addr, None, "secret-1").await), 400);

        assert_eq!(state.hub.count().await, 0);
        assert!(repo.examinations().await.is_empty());
    }

    #[tokio::test]
    async fn test_sensor_session_scenario() {
        let inference = spawn_inference_peer().await;
        let (addr, state, repo) = boot(&inference).await;
        let st = &*state;
        let store = &*repo;

        let (mut observer, _) = connect_async(format!("ws://{addr}/ws/observers"))
            .await
            .unwrap();
        eventually("observer registration", || async move {
            st.observers.count().await == 1
        })
        .await;
        eventually("inference link", || async move { st.relay.is_connected().await }).await;

        // s1 connects: examination #1 opens
        let mut s1 = connect_sensor(addr, Some("s1"), "secret-1").await.unwrap();
        eventually("s1 registration", || async move { st.hub.count().await == 1 }).await;
        assert!(st.sessions.is_open().await);
        assert_eq!(store.examinations().await[0].id, 1);

        // Three readings with a malformed message in between
        s1.send(Message::Text(reading_json(1.0).into())).await.unwrap();
        s1.send(Message::Text("{\"sensorID\": oops".into())).await.unwrap();
        s1.send(Message::Text(reading_json(2.0).into())).await.unwrap();
        s1.send(Message::Text(reading_json(3.5).into())).await.unwrap();

        for expected in ["result:1.0", "result:2.0", "result:3.5"] {
            let msg = tokio::time::timeout(Duration::from_secs(5), observer.next())
                .await
                .expect("observer should receive inference result")
                .unwrap()
                .unwrap();
            assert_eq!(msg, Message::Text(expected.into()));
        }

        let rows = store.rows_for(1).await;
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.reading.device_id.as_str() == "s1"));
        assert_eq!(state.relay.stats().await.sent, 3);

        // s1 leaves: examination #1 closes
        s1.close(None).await.unwrap();
        eventually("s1 cleanup", || async move {
            st.hub.count().await == 0 && !st.sessions.is_open().await
        })
        .await;
        assert!(store.examinations().await[0].end_time.is_some());
        assert!(!store.is_examination_open().await.unwrap());

        // s2 connects: a fresh examination #2
        let _s2 = connect_sensor(addr, Some("s2"), "secret-2").await.unwrap();
        eventually("s2 registration", || async move { st.hub.count().await == 1 }).await;
        let examinations = store.examinations().await;
        assert_eq!(examinations.len(), 2);
        assert_eq!(examinations[1].id, 2);
        assert!(examinations[1].is_open());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_connection() {
        let (addr, state, repo) = boot(UNREACHABLE_INFERENCE).await;
        let st = &*state;

        let mut first = connect_sensor(addr, Some("s1"), "secret-1").await.unwrap();
        eventually("first registration", || async move { st.hub.count().await == 1 }).await;
        let _second = connect_sensor(addr, Some("s1"), "secret-1").await.unwrap();

        // The superseded socket is closed by the server
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match first.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "superseded connection should be closed");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.hub.count().await, 1);
        assert!(state.sessions.is_open().await);
        assert_eq!(repo.examinations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_sensor_socket_outlives_handshake_timeout() {
        let mut config = test_config(UNREACHABLE_INFERENCE);
        config.sensors.handshake_timeout_secs = 1;
        let (addr, state, repo) = boot_with(config).await;
        let st = &*state;

        let mut s1 = connect_sensor(addr, Some("s1"), "secret-1").await.unwrap();
        eventually("s1 registration", || async move { st.hub.count().await == 1 }).await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        s1.send(Message::Text(reading_json(1.0).into())).await.unwrap();

        let store = &*repo;
        eventually("reading persisted", || async move {
            store.rows_for(1).await.len() == 1
        })
        .await;
        assert_eq!(state.hub.count().await, 1);
        assert!(state.sessions.is_open().await);
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let (addr, _state, _repo) = boot(UNREACHABLE_INFERENCE).await;

        let health: serde_json::Value = reqwest::get(format!("http://{addr}/api/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["service"], "ctg-relay");

        let _s1 = connect_sensor(addr, Some("s1"), "secret-1").await.unwrap();
        let status_url = format!("http://{addr}/api/status");
        let url = &status_url;
        eventually("status to list s1", || async move {
            let status: serde_json::Value =
                reqwest::get(url).await.unwrap().json().await.unwrap();
            status["sensors"] == serde_json::json!(["s1"])
        })
        .await;

        let status: serde_json::Value = reqwest::get(url).await.unwrap().json().await.unwrap();
        assert_eq!(status["session"], "open");
        assert_eq!(status["sensors_started"], 0);
        assert_eq!(status["examination"]["id"], 1);
        assert_eq!(status["inference"]["connected"], false);
    }
}
