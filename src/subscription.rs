//! Subscribe handshake and pipeline lifecycle.
//!
//! [`Subscriber`] is the cheap-to-clone entry point. Each
//! [`Subscriber::subscribe`] call builds a fresh [`Validator`] (so lookup
//! caches never outlive the run), spawns the [`MessagePipeline`] and only
//! then sends the subscribe request, so broadcasts that race the
//! acknowledgement are not lost.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{PipelineConfig, PipelineOptions};
use crate::error::PipelineError;
use crate::messages::{ControlKind, ControlMessage, ControlRequest, StreamMessage};
use crate::pipeline::{MessagePipeline, PipelineStage};
use crate::protocols::{Connection, SignatureVerifier, StreamRegistry};
use crate::validator::Validator;

/// Capacity of the channel used while waiting for an acknowledgement.
const RESPONSE_CHANNEL_SIZE: usize = 16;

#[derive(Clone)]
pub struct Subscriber {
    connection: Arc<dyn Connection>,
    registry: Arc<dyn StreamRegistry>,
    verifier: Arc<dyn SignatureVerifier>,
    config: PipelineConfig,
    counter: Arc<AtomicU64>,
}

impl Subscriber {
    pub fn new(
        connection: Arc<dyn Connection>,
        registry: Arc<dyn StreamRegistry>,
        verifier: Arc<dyn SignatureVerifier>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            connection,
            registry,
            verifier,
            config,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn subscribe(&self, options: PipelineOptions) -> Result<Subscription, PipelineError> {
        self.subscribe_with_stages(options, Vec::new()).await
    }

    /// Subscribe with post-processing stages appended after ordering.
    pub async fn subscribe_with_stages(
        &self,
        options: PipelineOptions,
        stages: Vec<Box<dyn PipelineStage>>,
    ) -> Result<Subscription, PipelineError> {
        let validator = Arc::new(Validator::new(
            self.registry.clone(),
            self.verifier.clone(),
            &self.config,
        ));
        let pipeline = MessagePipeline::spawn(
            self.connection.clone(),
            validator,
            &self.config,
            options.clone(),
            stages,
        );

        let request = ControlRequest::Subscribe {
            request_id: self.next_request_id(&options, "subscribe"),
            stream_id: options.stream_id.clone(),
            stream_partition: options.stream_partition,
        };
        if let Err(e) = self.request(request, ControlKind::SubscribeResponse).await {
            pipeline.cancel();
            return Err(e);
        }

        debug!(stream = %options.stream_id, partition = options.stream_partition, "subscribed");
        Ok(Subscription {
            subscriber: self.clone(),
            options,
            pipeline,
        })
    }

    fn next_request_id(&self, options: &PipelineOptions, action: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}-{}", options.key, action, n)
    }

    /// Send `request` and wait for its `expect` acknowledgement or an error response.
    async fn request(&self, request: ControlRequest, expect: ControlKind) -> Result<(), PipelineError> {
        let request_id = request.request_id().to_string();
        let (tx, mut rx) = mpsc::channel(RESPONSE_CHANNEL_SIZE);
        let ack_id = self.connection.on(expect, tx.clone());
        let error_id = self.connection.on(ControlKind::ErrorResponse, tx);

        let result = self.exchange(request, &request_id, &mut rx).await;

        self.connection.off(expect, ack_id);
        self.connection.off(ControlKind::ErrorResponse, error_id);
        result
    }

    async fn exchange(
        &self,
        request: ControlRequest,
        request_id: &str,
        rx: &mut mpsc::Receiver<ControlMessage>,
    ) -> Result<(), PipelineError> {
        self.connection
            .send(request)
            .await
            .map_err(PipelineError::ConnectionFailure)?;

        let response = async {
            while let Some(message) = rx.recv().await {
                if message.request_id() != Some(request_id) {
                    continue;
                }
                return match message {
                    ControlMessage::ErrorResponse { error_message, .. } => Err(PipelineError::ErrorResponse {
                        request_id: request_id.to_string(),
                        message: error_message,
                    }),
                    _ => Ok(()),
                };
            }
            Err(PipelineError::Closed)
        };
        tokio::time::timeout(self.config.response_timeout, response)
            .await
            .map_err(|_| PipelineError::ResponseTimeout(request_id.to_string()))?
    }
}

/// An acknowledged subscription and its running pipeline.
pub struct Subscription {
    subscriber: Subscriber,
    options: PipelineOptions,
    pipeline: MessagePipeline,
}

impl Subscription {
    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn pipeline(&self) -> &MessagePipeline {
        &self.pipeline
    }

    pub async fn next(&self) -> Option<Result<StreamMessage, PipelineError>> {
        self.pipeline.next().await
    }

    pub async fn collect<T: DeserializeOwned>(&self) -> Result<Vec<T>, PipelineError> {
        self.pipeline.collect().await
    }

    pub fn end(&self) {
        self.pipeline.end();
    }

    pub fn cancel(&self) {
        self.pipeline.cancel();
    }

    /// Send an unsubscribe request and close the pipeline.
    ///
    /// The pipeline is cancelled whether or not the network acknowledges.
    pub async fn unsubscribe(self) -> Result<(), PipelineError> {
        let request = ControlRequest::Unsubscribe {
            request_id: self.subscriber.next_request_id(&self.options, "unsubscribe"),
            stream_id: self.options.stream_id.clone(),
            stream_partition: self.options.stream_partition,
        };
        let result = self
            .subscriber
            .request(request, ControlKind::UnsubscribeResponse)
            .await;
        self.pipeline.cancel();

        if let Err(e) = &result {
            warn!(stream = %self.options.stream_id, error = %e, "unsubscribe not acknowledged");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::connection::ConnectionHub;
    use crate::crypto::Ed25519Verifier;
    use crate::identity::Identity;
    use crate::protocols::StreamMetadata;

    use anyhow::Result;
    use async_trait::async_trait;

    struct OpenRegistry;

    #[async_trait]
    impl StreamRegistry for OpenRegistry {
        async fn get_stream(&self, _stream_id: &str) -> Result<StreamMetadata> {
            Ok(StreamMetadata::default())
        }
        async fn is_publisher(&self, _address: &Identity, _stream_id: &str) -> Result<bool> {
            Ok(true)
        }
        async fn is_subscriber(&self, _address: &Identity, _stream_id: &str) -> Result<bool> {
            Ok(true)
        }
    }

    fn subscriber(hub: &Arc<ConnectionHub>) -> Subscriber {
        Subscriber::new(
            hub.clone(),
            Arc::new(OpenRegistry),
            Arc::new(Ed25519Verifier),
            PipelineConfig::default(),
        )
    }

    /// Answer subscribe/unsubscribe requests the way the network would.
    fn spawn_responder(hub: Arc<ConnectionHub>, mut outbound: mpsc::Receiver<ControlRequest>, fail: bool) {
        tokio::spawn(async move {
            while let Some(request) = outbound.recv().await {
                let response = match request {
                    _ if fail => ControlMessage::ErrorResponse {
                        request_id: request.request_id().to_string(),
                        error_message: "permission denied".into(),
                    },
                    ControlRequest::Subscribe { request_id, stream_id, stream_partition } => {
                        ControlMessage::SubscribeResponse { request_id, stream_id, stream_partition }
                    }
                    ControlRequest::Unsubscribe { request_id, stream_id, stream_partition } => {
                        ControlMessage::UnsubscribeResponse { request_id, stream_id, stream_partition }
                    }
                    ControlRequest::ResendRange { .. } => continue,
                };
                hub.dispatch(response).await;
            }
        });
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe_round_trip() {
        let (hub, outbound) = ConnectionHub::new();
        spawn_responder(hub.clone(), outbound, false);

        let subscription = subscriber(&hub)
            .subscribe(PipelineOptions::new("stream", 0))
            .await
            .unwrap();
        assert_eq!(subscription.options().stream_id, "stream");
        assert_eq!(hub.handler_count(ControlKind::BroadcastMessage), 1);
        assert_eq!(hub.handler_count(ControlKind::SubscribeResponse), 0);

        subscription.unsubscribe().await.unwrap();
        for _ in 0..100 {
            if hub.handler_count(ControlKind::BroadcastMessage) == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(hub.handler_count(ControlKind::BroadcastMessage), 0);
        assert_eq!(hub.handler_count(ControlKind::ErrorResponse), 0);
    }

    #[tokio::test]
    async fn error_response_fails_subscribe() {
        let (hub, outbound) = ConnectionHub::new();
        spawn_responder(hub.clone(), outbound, true);

        let result = subscriber(&hub).subscribe(PipelineOptions::new("stream", 0)).await;
        match result {
            Err(PipelineError::ErrorResponse { message, .. }) => assert_eq!(message, "permission denied"),
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("subscribe should fail"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_network_times_out() {
        let (hub, _outbound) = ConnectionHub::new();
        let subscriber = subscriber(&hub);
        let started = tokio::time::Instant::now();

        let result = subscriber.subscribe(PipelineOptions::new("stream", 0)).await;
        assert!(matches!(result, Err(PipelineError::ResponseTimeout(_))));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(hub.handler_count(ControlKind::SubscribeResponse), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_cancels_even_without_acknowledgement() {
        let (hub, mut outbound) = ConnectionHub::new();
        let subscriber = subscriber(&hub);

        let subscribing = tokio::spawn({
            let subscriber = subscriber.clone();
            async move { subscriber.subscribe(PipelineOptions::new("stream", 0)).await }
        });
        match outbound.recv().await {
            Some(ControlRequest::Subscribe { request_id, stream_id, stream_partition }) => {
                hub.dispatch(ControlMessage::SubscribeResponse { request_id, stream_id, stream_partition })
                    .await;
            }
            other => panic!("unexpected request {:?}", other),
        }
        let subscription = subscribing.await.unwrap().unwrap();

        let result = subscription.unsubscribe().await;
        assert!(matches!(result, Err(PipelineError::ResponseTimeout(_))));
        assert!(matches!(outbound.recv().await, Some(ControlRequest::Unsubscribe { .. })));
        for _ in 0..100 {
            if hub.handler_count(ControlKind::BroadcastMessage) == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(hub.handler_count(ControlKind::BroadcastMessage), 0);
    }
}
