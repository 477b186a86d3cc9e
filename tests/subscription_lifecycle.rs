//! End-to-end subscription tests through the public `Subscriber` facade.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use gapless::{
    encode_content, sign_stream_message, ConnectionHub, ControlKind, ControlMessage,
    ControlRequest, Ed25519Verifier, FnStage, Identity, Keypair, MessageRef, PipelineConfig,
    PipelineError, PipelineOptions, PipelineStage, SignaturePolicy, StreamMessage, StreamMetadata,
    StreamRegistry, Subscriber,
};
use tokio::sync::mpsc;

const STREAM: &str = "telemetry";

struct SinglePublisher {
    publisher: Identity,
    require_signed_data: bool,
}

#[async_trait]
impl StreamRegistry for SinglePublisher {
    async fn get_stream(&self, _stream_id: &str) -> Result<StreamMetadata> {
        Ok(StreamMetadata {
            partition_count: 4,
            require_signed_data: self.require_signed_data,
            require_encrypted_data: false,
        })
    }

    async fn is_publisher(&self, address: &Identity, _stream_id: &str) -> Result<bool> {
        Ok(*address == self.publisher)
    }

    async fn is_subscriber(&self, _address: &Identity, _stream_id: &str) -> Result<bool> {
        Ok(true)
    }
}

fn message(keypair: &Keypair, partition: u32, seq: u32, value: u64) -> StreamMessage {
    let mut message = StreamMessage::new(
        STREAM,
        partition,
        MessageRef::new(5000, seq),
        (seq > 1).then(|| MessageRef::new(5000, seq - 1)),
        keypair.identity(),
        "main",
        encode_content(&value).expect("encode failed"),
    );
    sign_stream_message(keypair, &mut message);
    message
}

/// Plays the network: acknowledges subscriptions and serves resends from `history`.
fn spawn_network(hub: Arc<ConnectionHub>, mut outbound: mpsc::Receiver<ControlRequest>, history: Vec<StreamMessage>) {
    tokio::spawn(async move {
        while let Some(request) = outbound.recv().await {
            match request {
                ControlRequest::Subscribe { request_id, stream_id, stream_partition } => {
                    hub.dispatch(ControlMessage::SubscribeResponse { request_id, stream_id, stream_partition })
                        .await;
                }
                ControlRequest::Unsubscribe { request_id, stream_id, stream_partition } => {
                    hub.dispatch(ControlMessage::UnsubscribeResponse { request_id, stream_id, stream_partition })
                        .await;
                }
                ControlRequest::ResendRange { request_id, stream_id, stream_partition, from, to, .. } => {
                    hub.dispatch(ControlMessage::ResendResponseResending {
                        request_id: request_id.clone(),
                        stream_id: stream_id.clone(),
                        stream_partition,
                    })
                    .await;
                    for message in history.iter().filter(|m| {
                        m.stream_partition == stream_partition && m.message_ref >= from && m.message_ref <= to
                    }) {
                        hub.dispatch(ControlMessage::UnicastMessage {
                            request_id: request_id.clone(),
                            message: message.clone(),
                        })
                        .await;
                    }
                    hub.dispatch(ControlMessage::ResendResponseResent { request_id, stream_id, stream_partition })
                        .await;
                }
            }
        }
    });
}

fn subscriber(hub: &Arc<ConnectionHub>, publisher: &Keypair, config: PipelineConfig) -> Subscriber {
    Subscriber::new(
        hub.clone(),
        Arc::new(SinglePublisher {
            publisher: publisher.identity(),
            require_signed_data: true,
        }),
        Arc::new(Ed25519Verifier),
        config,
    )
}

#[tokio::test]
async fn lossy_stream_is_collected_in_order_until_bye() {
    let publisher = Keypair::generate();
    let (hub, outbound) = ConnectionHub::new();

    let mut history: Vec<StreamMessage> = (1..=8).map(|seq| message(&publisher, 2, seq, u64::from(seq) * 10)).collect();
    let last = history.pop().unwrap();
    let mut bye = last.with_bye();
    sign_stream_message(&publisher, &mut bye);
    history.push(bye);
    spawn_network(hub.clone(), outbound, history.clone());

    let subscription = subscriber(&hub, &publisher, PipelineConfig::default())
        .subscribe(PipelineOptions::new(STREAM, 2))
        .await
        .expect("subscribe failed");
    assert_eq!(subscription.pipeline().stream_partition(), 2);

    // Broadcasts 3 and 6 are lost; 5 arrives twice.
    for index in [0, 1, 3, 4, 4, 6, 7] {
        hub.dispatch(ControlMessage::BroadcastMessage { message: history[index].clone() }).await;
    }

    let readings: Vec<u64> = subscription.collect().await.expect("collect failed");
    assert_eq!(readings, vec![10, 20, 30, 40, 50, 60, 70, 80]);

    subscription.unsubscribe().await.expect("unsubscribe failed");
    assert_eq!(hub.request_handle_count(), 0);
}

#[tokio::test]
async fn other_partitions_and_unsigned_data_are_filtered() {
    let publisher = Keypair::generate();
    let (hub, outbound) = ConnectionHub::new();
    spawn_network(hub.clone(), outbound, Vec::new());

    let subscription = subscriber(&hub, &publisher, PipelineConfig::default())
        .subscribe(PipelineOptions::new(STREAM, 0))
        .await
        .unwrap();

    let mut unsigned = message(&publisher, 0, 2, 2);
    unsigned.signature = None;

    hub.dispatch(ControlMessage::BroadcastMessage { message: message(&publisher, 1, 1, 100) }).await;
    hub.dispatch(ControlMessage::BroadcastMessage { message: message(&publisher, 0, 1, 1) }).await;
    hub.dispatch(ControlMessage::BroadcastMessage { message: unsigned }).await;
    hub.dispatch(ControlMessage::BroadcastMessage { message: message(&publisher, 0, 3, 3) }).await;

    let first = subscription.next().await.unwrap().unwrap();
    let second = subscription.next().await.unwrap().unwrap();
    assert_eq!(first.parsed_content::<u64>().unwrap(), 1);
    assert_eq!(second.parsed_content::<u64>().unwrap(), 3);

    subscription.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn concurrent_collect_is_rejected() {
    let publisher = Keypair::generate();
    let (hub, outbound) = ConnectionHub::new();
    spawn_network(hub.clone(), outbound, Vec::new());

    let subscription = subscriber(&hub, &publisher, PipelineConfig::default())
        .subscribe(PipelineOptions::new(STREAM, 0))
        .await
        .unwrap();

    let (first, second) = tokio::join!(subscription.collect::<u64>(), async {
        tokio::task::yield_now().await;
        let second = subscription.collect::<u64>().await;
        let mut last = message(&publisher, 0, 1, 7).with_bye();
        sign_stream_message(&publisher, &mut last);
        hub.dispatch(ControlMessage::BroadcastMessage { message: last }).await;
        second
    });

    assert!(matches!(second, Err(PipelineError::AlreadyCollecting)));
    assert_eq!(first.unwrap(), vec![7]);
}

#[tokio::test]
async fn stage_failure_surfaces_once_and_closes_subscription() {
    let publisher = Keypair::generate();
    let (hub, outbound) = ConnectionHub::new();
    spawn_network(hub.clone(), outbound, Vec::new());

    let reject_large: Box<dyn PipelineStage> = Box::new(FnStage::new("threshold", |message: StreamMessage| {
        let value: u64 = message.parsed_content()?;
        if value > 100 {
            anyhow::bail!("reading {} above threshold", value);
        }
        Ok(Some(message))
    }));
    let subscription = subscriber(&hub, &publisher, PipelineConfig::default())
        .subscribe_with_stages(PipelineOptions::new(STREAM, 0), vec![reject_large])
        .await
        .unwrap();

    hub.dispatch(ControlMessage::BroadcastMessage { message: message(&publisher, 0, 1, 50) }).await;
    hub.dispatch(ControlMessage::BroadcastMessage { message: message(&publisher, 0, 2, 500) }).await;
    hub.dispatch(ControlMessage::BroadcastMessage { message: message(&publisher, 0, 3, 60) }).await;

    assert!(subscription.next().await.unwrap().is_ok());
    match subscription.next().await {
        Some(Err(PipelineError::Stage { stage, source })) => {
            assert_eq!(stage, "threshold");
            assert!(source.to_string().contains("above threshold"));
        }
        other => panic!("expected stage failure, got {:?}", other),
    }
    assert!(subscription.next().await.is_none());
    assert_eq!(hub.handler_count(ControlKind::BroadcastMessage), 0);
}

#[tokio::test(start_paused = true)]
async fn never_policy_accepts_unverifiable_data() {
    let publisher = Keypair::generate();
    let stranger = Keypair::generate();
    let (hub, outbound) = ConnectionHub::new();
    spawn_network(hub.clone(), outbound, Vec::new());

    let config = PipelineConfig {
        verify_signatures: SignaturePolicy::Never,
        response_timeout: Duration::from_secs(1),
        ..PipelineConfig::default()
    };
    let subscription = subscriber(&hub, &publisher, config)
        .subscribe(PipelineOptions::new(STREAM, 0))
        .await
        .unwrap();

    hub.dispatch(ControlMessage::BroadcastMessage { message: message(&stranger, 0, 1, 1) }).await;
    let received = subscription.next().await.unwrap().unwrap();
    assert_eq!(received.publisher_id, stranger.identity());

    subscription.unsubscribe().await.unwrap();
}
