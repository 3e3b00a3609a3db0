use agenda_web::{AppState, WebConfig, serve};
use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(config: WebConfig) -> Result<SocketAddr> {
    let state = AppState::build(config).await?;
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind test listener")?;
    let addr = listener.local_addr()?;
    tokio::spawn(serve(listener, state, std::future::pending()));
    Ok(addr)
}

async fn connect(addr: SocketAddr) -> Result<Client> {
    let (ws, _) = connect_async(format!("ws://{addr}/schedule"))
        .await
        .context("websocket connect failed")?;
    Ok(ws)
}

async fn send(ws: &mut Client, value: Value) -> Result<()> {
    ws.send(Message::text(value.to_string())).await?;
    Ok(())
}

async fn next_text(ws: &mut Client) -> Result<Value> {
    loop {
        let Some(msg) = ws.next().await else {
            bail!("connection ended");
        };
        match msg? {
            Message::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
            Message::Close(_) => bail!("connection closed"),
            _ => continue,
        }
    }
}

async fn recv_json(ws: &mut Client) -> Result<Value> {
    timeout(Duration::from_secs(5), next_text(ws))
        .await
        .context("timed out waiting for message")?
}

async fn recv_tagged(ws: &mut Client, tag: &str) -> Result<Value> {
    loop {
        let value = recv_json(ws).await?;
        if value["type"] == tag {
            return Ok(value);
        }
    }
}

async fn live_sessions(addr: SocketAddr) -> Result<u64> {
    let health: Value = reqwest::get(format!("http://{addr}/health"))
        .await?
        .json()
        .await?;
    health["sessions"].as_u64().context("missing session count")
}

fn fetch(start: &str, end: &str) -> Value {
    json!({
        "type": "fetch_schedule",
        "payload": { "periodStart": start, "periodEnd": end }
    })
}

fn create(start: &str, end: &str) -> Value {
    json!({
        "type": "create_task",
        "payload": {
            "start": start,
            "end": end,
            "detail": "project intro",
            "userName": "Grace",
            "company": "Compilers Inc",
            "email": "grace@example.com",
            "phone": "555-0199",
            "roles": "engineer",
            "method": "zoom"
        }
    })
}

fn tasks_in(schedule: &Value) -> Vec<String> {
    let mut tids = Vec::new();
    for hour in schedule["agenda"]["hourlyAgenda"].as_array().into_iter().flatten() {
        for bucket in hour["tasksByWeekday"].as_object().into_iter().flatten() {
            for task in bucket.1.as_array().into_iter().flatten() {
                if let Some(tid) = task["tid"].as_str() {
                    tids.push(tid.to_string());
                }
            }
        }
    }
    tids
}

#[tokio::test]
async fn fetch_schedule_returns_week_grid() -> Result<()> {
    let addr = start_server(WebConfig::default()).await?;
    let mut ws = connect(addr).await?;

    send(&mut ws, fetch("2025-03-03T00:00:00Z", "2025-03-10T00:00:00Z")).await?;
    let reply = recv_tagged(&mut ws, "fetch_schedule").await?;
    assert_eq!(reply["payload"]["currentPeriod"]["kind"], "weekly");
    assert_eq!(
        reply["payload"]["agenda"]["hourlyAgenda"].as_array().map(Vec::len),
        Some(10)
    );
    assert_eq!(reply["payload"]["agenda"]["hourlyAgenda"][0]["hour12"], "08 AM");
    Ok(())
}

#[tokio::test]
async fn malformed_payload_keeps_connection_open() -> Result<()> {
    let addr = start_server(WebConfig::default()).await?;
    let mut ws = connect(addr).await?;

    send(
        &mut ws,
        json!({ "type": "fetch_schedule", "payload": { "periodStart": 5 } }),
    )
    .await?;
    let err = recv_tagged(&mut ws, "error").await?;
    assert_eq!(err["payload"]["connCode"], 4003);
    assert_eq!(err["payload"]["codeMessage"], "Json Decode Error");

    send(&mut ws, json!({ "type": "book_everything", "payload": {} })).await?;
    let err = recv_tagged(&mut ws, "error").await?;
    assert_eq!(err["payload"]["connCode"], 1003);

    send(&mut ws, fetch("2025-03-03T00:00:00Z", "2025-03-10T00:00:00Z")).await?;
    recv_tagged(&mut ws, "fetch_schedule").await?;
    Ok(())
}

#[tokio::test]
async fn undecodable_envelope_closes_connection() -> Result<()> {
    let addr = start_server(WebConfig::default()).await?;
    let mut ws = connect(addr).await?;

    ws.send(Message::text("this is not json")).await?;
    let err = recv_json(&mut ws).await?;
    assert_eq!(err["type"], "error");
    assert_eq!(err["payload"]["connCode"], 4003);
    assert!(recv_json(&mut ws).await.is_err());
    Ok(())
}

#[tokio::test]
async fn disallowed_origin_is_forbidden() -> Result<()> {
    let addr = start_server(WebConfig::default()).await?;
    let mut request = format!("ws://{addr}/schedule").into_client_request()?;
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("https://evil.example"));

    match connect_async(request).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status().as_u16(), 403);
        }
        Err(other) => bail!("unexpected error: {other}"),
        Ok(_) => bail!("upgrade should have been refused"),
    }

    let mut request = format!("ws://{addr}/schedule").into_client_request()?;
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("http://localhost:3000"));
    connect_async(request).await?;
    Ok(())
}

#[tokio::test]
async fn create_pushes_to_overlapping_sessions_only() -> Result<()> {
    let addr = start_server(WebConfig::default()).await?;
    let mut first = connect(addr).await?;
    let mut second = connect(addr).await?;
    let mut disjoint = connect(addr).await?;
    let mut booker = connect(addr).await?;

    send(&mut first, fetch("2025-03-03T00:00:00Z", "2025-03-10T00:00:00Z")).await?;
    recv_tagged(&mut first, "fetch_schedule").await?;
    send(&mut second, fetch("2025-03-05T00:00:00Z", "2025-03-07T00:00:00Z")).await?;
    recv_tagged(&mut second, "fetch_schedule").await?;
    send(&mut disjoint, fetch("2025-04-07T00:00:00Z", "2025-04-14T00:00:00Z")).await?;
    recv_tagged(&mut disjoint, "fetch_schedule").await?;

    // Wednesday 10:00
    send(&mut booker, create("2025-03-05T10:00:00Z", "2025-03-05T11:00:00Z")).await?;
    let created = recv_tagged(&mut booker, "create_task").await?;
    let tid = created["payload"]["task"]["tid"]
        .as_str()
        .context("missing tid")?
        .to_string();
    assert!(created["payload"]["uid"].as_str().is_some_and(|u| !u.is_empty()));

    for ws in [&mut first, &mut second] {
        let pushed = recv_tagged(ws, "broadcast_schedule").await?;
        assert!(tasks_in(&pushed["payload"]).contains(&tid));
        assert!(
            timeout(Duration::from_millis(300), recv_json(ws))
                .await
                .is_err(),
            "overlapping session should receive exactly one push"
        );
    }

    assert!(
        timeout(Duration::from_millis(300), recv_json(&mut disjoint))
            .await
            .is_err(),
        "disjoint session should not receive a push"
    );
    Ok(())
}

#[tokio::test]
async fn remove_twice_reports_zero() -> Result<()> {
    let addr = start_server(WebConfig::default()).await?;
    let mut ws = connect(addr).await?;

    send(&mut ws, create("2025-03-04T09:00:00Z", "2025-03-04T10:00:00Z")).await?;
    let created = recv_tagged(&mut ws, "create_task").await?;
    let remove = json!({
        "type": "remove_task",
        "payload": {
            "tid": created["payload"]["task"]["tid"],
            "uid": created["payload"]["uid"],
        }
    });

    send(&mut ws, remove.clone()).await?;
    assert_eq!(recv_tagged(&mut ws, "remove_task").await?["payload"]["removed"], 1);
    send(&mut ws, remove).await?;
    assert_eq!(recv_tagged(&mut ws, "remove_task").await?["payload"]["removed"], 0);
    Ok(())
}

#[tokio::test]
async fn edit_with_wrong_uid_is_denied() -> Result<()> {
    let addr = start_server(WebConfig::default()).await?;
    let mut ws = connect(addr).await?;

    send(&mut ws, create("2025-03-04T09:00:00Z", "2025-03-04T10:00:00Z")).await?;
    let created = recv_tagged(&mut ws, "create_task").await?;

    send(
        &mut ws,
        json!({
            "type": "update_task",
            "payload": {
                "tid": created["payload"]["task"]["tid"],
                "uid": "someone-else",
                "start": "2025-03-04T11:00:00Z",
                "end": "2025-03-04T12:00:00Z",
                "detail": "hijack"
            }
        }),
    )
    .await?;
    let err = recv_tagged(&mut ws, "error").await?;
    assert_eq!(err["payload"]["connCode"], 4009);
    Ok(())
}

#[tokio::test]
async fn http_endpoints() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let about_path = dir.path().join("about.json");
    std::fs::write(&about_path, r#"{"name":"Zach","skills":["rust"]}"#)?;

    let addr = start_server(WebConfig {
        about_path: Some(about_path),
        ..WebConfig::default()
    })
    .await?;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(health["status"], "ok");

    let about: Value = client
        .get(format!("http://{addr}/about"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(about["skills"][0], "rust");

    let resp = client
        .post(format!(
            "http://{addr}/zypher?txt=hello&shft=3&shftcount=2&hshcount=1&alt=true&ignspace=false&restricthash=true"
        ))
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await?;
    assert_eq!(body["result"].as_str().map(str::len), Some(64));

    let resp = client
        .post(format!("http://{addr}/zypher?txt=hello&shft=abc"))
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 400);
    Ok(())
}

#[tokio::test]
async fn unanswered_pings_evict_the_session() -> Result<()> {
    let addr = start_server(WebConfig {
        keepalive_secs: 2,
        ..WebConfig::default()
    })
    .await?;
    // never polled, so the client stack cannot answer pings
    let _silent = connect(addr).await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(live_sessions(addr).await?, 1);

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(live_sessions(addr).await?, 0);
    Ok(())
}

#[tokio::test]
async fn answered_pings_keep_the_session() -> Result<()> {
    let addr = start_server(WebConfig {
        keepalive_secs: 2,
        ..WebConfig::default()
    })
    .await?;
    let mut ws = connect(addr).await?;
    let pings = Arc::new(AtomicU32::new(0));

    let seen = Arc::clone(&pings);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Ping(data) = msg {
                seen.fetch_add(1, Ordering::SeqCst);
                if ws.send(Message::Pong(data)).await.is_err() {
                    break;
                }
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert!(pings.load(Ordering::SeqCst) >= 2);
    assert_eq!(live_sessions(addr).await?, 1);
    reader.abort();
    Ok(())
}
