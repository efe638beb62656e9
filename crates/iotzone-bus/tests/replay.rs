//! Subscription replay against a minimal in-process MQTT 3.1.1 broker.
//!
//! The broker acknowledges CONNECT, SUBSCRIBE and PINGREQ, reports every
//! subscribed topic with the index of its connection, and drops the first
//! connection right after its first SUBSCRIBE.

use iotzone_bus::{handler, BusConfig, MessageBus, MqttBus};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const CONNECT: u8 = 1;
const SUBSCRIBE: u8 = 8;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;

    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        len |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    let mut body = vec![0; len];
    stream.read_exact(&mut body).await?;
    Ok((header >> 4, body))
}

fn subscribed_topic(body: &[u8]) -> String {
    let len = usize::from(u16::from_be_bytes([body[2], body[3]]));
    String::from_utf8(body[4..4 + len].to_vec()).unwrap()
}

async fn serve(mut stream: TcpStream, index: usize, topics: mpsc::UnboundedSender<(usize, String)>) {
    while let Ok((kind, body)) = read_packet(&mut stream).await {
        let written = match kind {
            CONNECT => stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await,
            SUBSCRIBE => {
                let written = stream.write_all(&[0x90, 0x03, body[0], body[1], 0x01]).await;
                let _ = topics.send((index, subscribed_topic(&body)));
                if index == 1 {
                    return;
                }
                written
            }
            PINGREQ => stream.write_all(&[0xd0, 0x00]).await,
            DISCONNECT => return,
            _ => Ok(()),
        };
        if written.is_err() {
            return;
        }
    }
}

async fn start_broker() -> (u16, mpsc::UnboundedReceiver<(usize, String)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut index = 0;
        while let Ok((stream, _)) = listener.accept().await {
            index += 1;
            tokio::spawn(serve(stream, index, tx.clone()));
        }
    });

    (port, rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscriptions_are_replayed_after_connect_and_reconnect() {
    let (port, mut topics) = start_broker().await;
    let pattern = "zone1/+/+/$node";

    let bus = MqttBus::new(BusConfig::new(format!("tcp://127.0.0.1:{port}")));
    bus.subscribe(pattern, handler(|_, _| Ok(()))).await.unwrap();
    bus.connect(None).await.unwrap();

    let first = timeout(Duration::from_secs(5), topics.recv())
        .await
        .expect("timeout waiting for first SUBSCRIBE")
        .expect("broker stopped");
    assert_eq!(first, (1, pattern.to_string()));

    // The broker dropped the first connection; the bus reconnects on its own.
    let second = timeout(Duration::from_secs(15), topics.recv())
        .await
        .expect("timeout waiting for replayed SUBSCRIBE")
        .expect("broker stopped");
    assert_eq!(second, (2, pattern.to_string()));
    assert!(bus.is_connected());

    bus.disconnect().await;
    assert!(!bus.is_connected());
}
