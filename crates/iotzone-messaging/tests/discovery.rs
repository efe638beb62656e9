use iotzone_bus::{handler, MemoryBus, MessageBus};
use iotzone_core::{Address, KeyPair, NodeDiscoveryMessage, OutputDiscoveryMessage};
use iotzone_messaging::{resolver, DiscoveryCollection, MessageSigner, PublicKeyResolver};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Resolves sender addresses to keys by publisher id, the second segment.
fn publisher_keys(keys: &[(&str, &KeyPair)]) -> PublicKeyResolver {
    let keys: HashMap<String, p256::PublicKey> = keys
        .iter()
        .map(|(publisher_id, key)| ((*publisher_id).to_string(), key.public_key()))
        .collect();
    resolver(move |sender| {
        let publisher_id = sender.split('/').nth(1)?;
        keys.get(publisher_id).cloned()
    })
}

struct Zone {
    bus: Arc<MemoryBus>,
    publisher_key: KeyPair,
    nodes: Arc<DiscoveryCollection<NodeDiscoveryMessage>>,
}

async fn zone() -> Zone {
    let bus = Arc::new(MemoryBus::new());
    let publisher_key = KeyPair::generate();
    let signer = MessageSigner::new(bus.clone())
        .with_resolver(publisher_keys(&[("pub1", &publisher_key)]));
    let nodes = Arc::new(DiscoveryCollection::new(Arc::new(signer), None));
    nodes.subscribe("zone1/+/+/$node").await.unwrap();

    Zone {
        bus,
        publisher_key,
        nodes,
    }
}

#[tokio::test]
async fn signed_discovery_is_admitted() {
    let zone = zone().await;
    let publisher = MessageSigner::new(zone.bus.clone()).with_signing_key(zone.publisher_key.clone());

    let node = NodeDiscoveryMessage::new("zone1", "pub1", "node1", "thermostat");
    publisher.publish_signed(&node.address, true, &node).await.unwrap();

    let found = zone.nodes.get("zone1/pub1/node1", "", "").unwrap();
    assert_eq!(found.node_type, "thermostat");
    assert!(zone.nodes.get_by_address("zone1/pub1/node1/$set").is_some());
    assert_eq!(zone.nodes.error_count(), 0);
}

#[tokio::test]
async fn unsigned_discovery_is_rejected_and_counted() {
    let zone = zone().await;
    let publisher = MessageSigner::new(zone.bus.clone());

    let node = NodeDiscoveryMessage::new("zone1", "pub1", "node1", "thermostat");
    publisher.publish_object(&node.address, true, &node, None).await.unwrap();

    assert!(zone.nodes.is_empty());
    assert_eq!(zone.nodes.error_count(), 1);
}

#[tokio::test]
async fn wrongly_signed_discovery_is_rejected() {
    let zone = zone().await;
    let impostor = MessageSigner::new(zone.bus.clone()).with_signing_key(KeyPair::generate());

    let node = NodeDiscoveryMessage::new("zone1", "pub1", "node1", "thermostat");
    impostor.publish_signed(&node.address, true, &node).await.unwrap();

    let unknown = NodeDiscoveryMessage::new("zone1", "pub9", "node1", "thermostat");
    impostor.publish_signed(&unknown.address, true, &unknown).await.unwrap();

    assert!(zone.nodes.is_empty());
    assert_eq!(zone.nodes.error_count(), 2);
}

#[tokio::test]
async fn malformed_payload_is_counted() {
    let zone = zone().await;

    zone.bus
        .publish("zone1/pub1/node1/$node", false, b"\x00\x01 not a message")
        .await
        .unwrap();
    zone.bus
        .publish("zone1/pub1/node1/$node", false, b"a.b.c")
        .await
        .unwrap();

    assert!(zone.nodes.is_empty());
    assert_eq!(zone.nodes.error_count(), 2);
}

#[tokio::test]
async fn encrypted_discovery_is_decrypted_and_verified() {
    let bus = Arc::new(MemoryBus::new());
    let publisher_key = KeyPair::generate();
    let receiver_key = KeyPair::generate();

    let receiver = MessageSigner::new(bus.clone())
        .with_signing_key(receiver_key.clone())
        .with_resolver(publisher_keys(&[("pub1", &publisher_key)]));
    let outputs: Arc<DiscoveryCollection<OutputDiscoveryMessage>> =
        Arc::new(DiscoveryCollection::new(Arc::new(receiver), None));
    outputs.subscribe("zone1/+/+/+/+/$output").await.unwrap();

    let publisher = MessageSigner::new(bus.clone()).with_signing_key(publisher_key);
    let node = Address::node("zone1", "pub1", "node1");
    let output = OutputDiscoveryMessage::new(&node, "temperature", "0");
    publisher
        .publish_encrypted(&output.address, true, &output, &receiver_key.public_key())
        .await
        .unwrap();

    let found = outputs.get("zone1/pub1/node1", "temperature", "0").unwrap();
    assert_eq!(found.output_type, "temperature");
    assert_eq!(outputs.get_by_address_prefix("zone1/pub1/node1").len(), 1);
    assert!(outputs.get_by_address_prefix("zone1/pub1/node").is_empty());
}

#[tokio::test]
async fn collection_resolver_overrides_signer_resolver() {
    let bus = Arc::new(MemoryBus::new());
    let trusted = KeyPair::generate();

    let signer = Arc::new(MessageSigner::new(bus.clone()).with_resolver(resolver(|_| None)));
    let nodes = Arc::new(DiscoveryCollection::<NodeDiscoveryMessage>::new(
        signer,
        Some(publisher_keys(&[("pub1", &trusted)])),
    ));
    nodes.subscribe("zone1/#").await.unwrap();

    let publisher = MessageSigner::new(bus.clone()).with_signing_key(trusted);
    let node = NodeDiscoveryMessage::new("zone1", "pub1", "node1", "switch");
    publisher.publish_signed(&node.address, false, &node).await.unwrap();

    assert_eq!(nodes.len(), 1);
}

#[tokio::test]
async fn dropped_collection_ignores_messages() {
    let zone = zone().await;
    let bus = zone.bus.clone();
    let publisher = MessageSigner::new(bus.clone()).with_signing_key(zone.publisher_key.clone());
    drop(zone);

    let node = NodeDiscoveryMessage::new("zone1", "pub1", "node1", "thermostat");
    publisher.publish_signed(&node.address, true, &node).await.unwrap();

    assert_eq!(bus.nr_publications(), 1);
}

#[tokio::test]
async fn wildcard_subscriptions_select_publishers() {
    let bus = MemoryBus::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    bus.subscribe(
        "+/pub1/#",
        handler(move |address, _| {
            sink.lock().unwrap().push(address.to_string());
            Ok(())
        }),
    )
    .await
    .unwrap();

    bus.publish("domain1/pub1/anything/more/segments", false, b"{}")
        .await
        .unwrap();
    bus.publish("domain1/pub2/x", false, b"{}").await.unwrap();

    assert_eq!(
        *received.lock().unwrap(),
        vec!["domain1/pub1/anything/more/segments".to_string()]
    );
}

#[derive(Clone)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn rejections_are_logged_under_injected_span() {
    let output = Arc::new(Mutex::new(Vec::new()));
    let writer = Capture(output.clone());
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let bus = Arc::new(MemoryBus::new());
            let signer = Arc::new(MessageSigner::new(bus.clone()));
            let nodes = Arc::new(
                DiscoveryCollection::<NodeDiscoveryMessage>::new(signer, None)
                    .with_span(tracing::info_span!("zone1_nodes")),
            );
            nodes.subscribe("zone1/#").await.unwrap();

            bus.publish("zone1/pub1/node1/$node", false, b"{}").await.unwrap();
            assert_eq!(nodes.error_count(), 1);
        });
    });

    let logged = String::from_utf8(output.lock().unwrap().clone()).unwrap();
    assert!(logged.contains("zone1_nodes"));
    assert!(logged.contains("Rejected discovery message"));
}
