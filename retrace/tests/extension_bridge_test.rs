use std::{sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use retrace::{BridgeConfig, ExtensionBridge, PeerSignal};
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::Message};

async fn start_bridge() -> Arc<ExtensionBridge> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
    Arc::new(
        ExtensionBridge::start(&BridgeConfig {
            addr: "127.0.0.1:0".into(),
            ..Default::default()
        })
        .await,
    )
}

async fn wait_for_client(bridge: &ExtensionBridge) {
    for _ in 0..100 {
        if bridge.is_client_connected().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("client never registered with the bridge");
}

#[tokio::test]
async fn extension_bridge_eval_roundtrip() {
    let bridge = start_bridge().await;
    let addr = bridge.local_addr().expect("bridge bound");

    let (ws, _) = connect_async(format!("ws://{addr}"))
        .await
        .expect("ws connect");
    let (mut writer, mut reader) = ws.split();
    writer
        .send(Message::Text(
            r#"{"type":"hello","url":"https://example.com/"}"#.into(),
        ))
        .await
        .expect("send hello");
    wait_for_client(&bridge).await;

    let bridge_for_task = bridge.clone();
    let eval_handle = tokio::spawn(async move {
        bridge_for_task
            .eval("(()=>{return 'ok';})()", Duration::from_secs(3))
            .await
    });

    let request = tokio::time::timeout(Duration::from_secs(3), reader.next())
        .await
        .expect("eval request in time")
        .expect("stream open")
        .expect("ws message");
    let request: Value = serde_json::from_str(&request.into_text().unwrap()).unwrap();
    assert_eq!(request["action"], "eval");
    let id = request["id"].as_str().expect("request id").to_string();

    writer
        .send(Message::Text(format!(
            r#"{{"id":"{id}","ok":true,"result":"ok"}}"#
        )))
        .await
        .expect("send result");

    let res = eval_handle
        .await
        .expect("eval task join")
        .expect("bridge eval");
    assert_eq!(res, Value::String("ok".into()));
}

#[tokio::test]
async fn extension_bridge_answers_ping_and_forwards_events() {
    let bridge = start_bridge().await;
    let addr = bridge.local_addr().expect("bridge bound");
    let mut signals = bridge.subscribe();

    let (ws, _) = connect_async(format!("ws://{addr}"))
        .await
        .expect("ws connect");
    let (mut writer, mut reader) = ws.split();
    writer
        .send(Message::Text(
            r#"{"type":"bridge_event","eventType":"ping","payload":{}}"#.into(),
        ))
        .await
        .expect("send ping");

    let pong = tokio::time::timeout(Duration::from_secs(3), reader.next())
        .await
        .expect("pong in time")
        .expect("stream open")
        .expect("ws message");
    let pong: Value = serde_json::from_str(&pong.into_text().unwrap()).unwrap();
    assert_eq!(pong["action"], "pong");

    writer
        .send(Message::Text(
            r##"{"type":"bridge_event","eventType":"elementClick","payload":{"cssSelector":"#go"}}"##
                .into(),
        ))
        .await
        .expect("send click");

    let click = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match signals.recv().await {
                Ok(PeerSignal::BridgeEvent {
                    event_type,
                    payload,
                }) if event_type == "elementClick" => return payload,
                Ok(_) => continue,
                Err(e) => panic!("signal stream failed: {e}"),
            }
        }
    })
    .await
    .expect("click forwarded");
    assert_eq!(click["cssSelector"], "#go");
}

#[tokio::test]
async fn extension_bridge_reports_page_errors() {
    let bridge = start_bridge().await;
    let addr = bridge.local_addr().expect("bridge bound");
    let (ws, _) = connect_async(format!("ws://{addr}"))
        .await
        .expect("ws connect");
    let (mut writer, mut reader) = ws.split();
    writer
        .send(Message::Text(r#"{"type":"hello"}"#.into()))
        .await
        .expect("send hello");
    wait_for_client(&bridge).await;

    let bridge_for_task = bridge.clone();
    let eval_handle =
        tokio::spawn(async move { bridge_for_task.eval("boom()", Duration::from_secs(3)).await });

    let request = reader.next().await.expect("open").expect("message");
    let request: Value = serde_json::from_str(&request.into_text().unwrap()).unwrap();
    let id = request["id"].as_str().unwrap().to_string();
    writer
        .send(Message::Text(format!(
            r#"{{"id":"{id}","ok":false,"error":"ReferenceError: boom is not defined"}}"#
        )))
        .await
        .unwrap();

    let err = eval_handle.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), "page_error");
    assert!(err.to_string().contains("boom is not defined"));
}
