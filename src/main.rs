use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use gapless::{
    encode_content, sign_stream_message, ConnectionHub, ControlMessage, ControlRequest,
    Ed25519Verifier, Identity, Keypair, MessageRef, PipelineConfig, PipelineOptions,
    StreamMessage, StreamMetadata, StreamRegistry, Subscriber,
};

const STREAM_ID: &str = "demo/readings";
const CHAIN_ID: &str = "chain-0";

/// Simulate a lossy publisher and reconstruct its stream.
#[derive(Parser, Debug)]
#[command(name = "gapless")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Messages to publish. The last one ends the stream.
    #[arg(short, long, default_value = "20")]
    messages: u32,

    /// Drop every Nth broadcast (0 disables).
    #[arg(short = 'n', long, default_value = "4")]
    drop_every: u32,

    /// Additionally drop broadcasts at random with this probability.
    #[arg(short = 'r', long, default_value = "0.0")]
    drop_rate: f64,

    /// Milliseconds one resend attempt may take.
    #[arg(short = 't', long, default_value = "500")]
    gap_fill_timeout_ms: u64,

    /// Resend attempts per gap.
    #[arg(short = 'a', long, default_value = "3")]
    max_gap_requests: u32,

    /// Never answer resend requests, so every gap is eventually abandoned.
    #[arg(long)]
    unresponsive: bool,
}

/// Single-publisher registry requiring signed data.
struct DemoRegistry {
    publisher: Identity,
}

#[async_trait]
impl StreamRegistry for DemoRegistry {
    async fn get_stream(&self, _stream_id: &str) -> Result<StreamMetadata> {
        Ok(StreamMetadata {
            partition_count: 1,
            require_signed_data: true,
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

fn build_chain(keypair: &Keypair, count: u32) -> Result<Vec<StreamMessage>> {
    let mut chain = Vec::with_capacity(count as usize);
    let mut prev_ref = None;
    for seq in 0..count {
        let message_ref = MessageRef::new(1_700_000_000_000 + u64::from(seq), 0);
        let content = encode_content(&u64::from(seq)).context("failed to encode reading")?;
        let mut message = StreamMessage::new(
            STREAM_ID,
            0,
            message_ref,
            prev_ref,
            keypair.identity(),
            CHAIN_ID,
            content,
        );
        if seq + 1 == count {
            message = message.with_bye();
        }
        sign_stream_message(keypair, &mut message);
        prev_ref = Some(message_ref);
        chain.push(message);
    }
    Ok(chain)
}

/// Answer control requests the way a storage node would.
async fn respond(
    hub: Arc<ConnectionHub>,
    mut outbound: mpsc::Receiver<ControlRequest>,
    history: Arc<Vec<StreamMessage>>,
    unresponsive: bool,
) {
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
            ControlRequest::ResendRange { request_id, from, to, .. } => {
                if unresponsive {
                    debug!(request_id = %request_id, "ignoring resend request");
                    continue;
                }
                info!(request_id = %request_id, from = %from, to = %to, "serving resend");
                for message in history.iter().filter(|m| m.message_ref >= from && m.message_ref <= to) {
                    hub.dispatch(ControlMessage::UnicastMessage {
                        request_id: request_id.clone(),
                        message: message.clone(),
                    })
                    .await;
                }
                hub.dispatch(ControlMessage::ResendResponseResent {
                    request_id,
                    stream_id: STREAM_ID.to_string(),
                    stream_partition: 0,
                })
                .await;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if args.messages == 0 {
        anyhow::bail!("--messages must be at least 1");
    }

    let keypair = Keypair::generate();
    info!("Publisher identity: {}", keypair.identity());

    let history = Arc::new(build_chain(&keypair, args.messages)?);
    let (hub, outbound) = ConnectionHub::new();
    tokio::spawn(respond(hub.clone(), outbound, history.clone(), args.unresponsive));

    let config = PipelineConfig {
        gap_fill_timeout: Duration::from_millis(args.gap_fill_timeout_ms),
        max_gap_requests: args.max_gap_requests,
        ..PipelineConfig::default()
    };
    let subscriber = Subscriber::new(
        hub.clone(),
        Arc::new(DemoRegistry { publisher: keypair.identity() }),
        Arc::new(Ed25519Verifier),
        config,
    );
    let subscription = subscriber
        .subscribe(PipelineOptions::new(STREAM_ID, 0))
        .await
        .context("subscribe failed")?;

    let publisher = {
        let hub = hub.clone();
        let history = history.clone();
        let drop_every = args.drop_every;
        let drop_rate = args.drop_rate.clamp(0.0, 1.0);
        tokio::spawn(async move {
            let mut dropped = 0u32;
            let last = history.len().saturating_sub(1);
            for (index, message) in history.iter().enumerate() {
                let position = index as u32 + 1;
                let scheduled = drop_every > 0 && position % drop_every == 0;
                let unlucky = rand::thread_rng().gen_bool(drop_rate);
                // The closing message is always delivered so the stream can end.
                if index != last && (scheduled || unlucky) {
                    dropped += 1;
                    debug!(message_ref = %message.message_ref, "dropping broadcast");
                    continue;
                }
                hub.dispatch(ControlMessage::BroadcastMessage { message: message.clone() }).await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            dropped
        })
    };

    let mut received = Vec::new();
    while let Some(item) = subscription.next().await {
        match item {
            Ok(message) => {
                let reading: u64 = message.parsed_content()?;
                info!(
                    message_ref = %message.message_ref,
                    reading,
                    message_id = %hex::encode(&message.message_id()[..8]),
                    "ordered"
                );
                received.push(reading);
            }
            Err(e) => {
                warn!(error = %e, "pipeline failed");
                break;
            }
        }
    }

    let dropped = publisher.await.context("publisher task failed")?;
    let missing = u64::from(args.messages).saturating_sub(received.len() as u64);
    info!(
        published = args.messages,
        dropped,
        delivered = received.len(),
        missing,
        "stream complete"
    );

    if let Err(e) = subscription.unsubscribe().await {
        warn!(error = %e, "unsubscribe failed");
    }

    Ok(())
}
