//! Batching dispatcher.
//!
//! Operations are split into an isolated bucket and a batchable bucket, then
//! grouped by resolved destination. Isolated operations are sent one per
//! call, concurrently, outside the ambient transaction. Batchable groups are
//! packed into size-bounded batches; a message that does not fit even an
//! empty batch is sent on its own after that destination's batches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::{join_all, BoxFuture, FutureExt};
use tracing::{debug, error, warn, Instrument, Span};

use super::sender_registry::SenderRegistry;
use super::settings::DispatchSettings;
use crate::client::{BrokerClient, BrokerSender, MessageBatch};
use crate::error::{BrokerError, DispatchError};
use crate::message::{headers, BrokerMessage, DispatchConsistency, OutgoingOperation};
use crate::routing::DestinationRouter;
use crate::transaction::{TransactionBinding, TransactionScope};

/// Logged when the broker cannot be reached.
pub const CONNECTIVITY_GUIDANCE: &str = "could not connect to the broker; if outbound AMQP ports are blocked, switch the transport to AMQP over WebSockets";

struct DestinationGroup<'a> {
    destination: String,
    is_multicast: bool,
    operations: Vec<&'a OutgoingOperation>,
}

struct IsolatedSend<'a> {
    destination: String,
    is_multicast: bool,
    operation: &'a OutgoingOperation,
}

/// Batches packed for one destination.
struct Packed {
    batches: Vec<Box<dyn MessageBatch>>,
    oversized: Vec<BrokerMessage>,
}

/// Sends outgoing operations through cached per-destination senders.
///
/// ## Example
///
/// ```
/// use std::sync::Arc;
///
/// use servicebus_transport::client::InMemoryBroker;
/// use servicebus_transport::dispatch::MessageDispatcher;
/// use servicebus_transport::message::{OutgoingMessage, OutgoingOperation};
/// use servicebus_transport::routing::DestinationRouter;
/// use servicebus_transport::topology::Topology;
///
/// # tokio_test_block(async {
/// let broker = InMemoryBroker::new();
/// let router = DestinationRouter::new(Arc::new(Topology::default()));
/// let dispatcher = MessageDispatcher::new(Arc::new(broker.clone()), router);
///
/// let op = OutgoingOperation::unicast(OutgoingMessage::new("m1", b"{}".to_vec()), "billing");
/// dispatcher.dispatch(&[op], None).await.unwrap();
/// assert_eq!(broker.delivered("billing").len(), 1);
/// # });
/// # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
pub struct MessageDispatcher {
    client: Arc<dyn BrokerClient>,
    router: Arc<DestinationRouter>,
    senders: Arc<SenderRegistry>,
    settings: DispatchSettings,
    span: Span,
}

impl MessageDispatcher {
    pub fn new(client: Arc<dyn BrokerClient>, router: DestinationRouter) -> Self {
        Self {
            client,
            router: Arc::new(router),
            senders: Arc::new(SenderRegistry::new()),
            settings: DispatchSettings::default(),
            span: tracing::info_span!("message_dispatcher"),
        }
    }

    /// Share a sender cache with other dispatchers.
    pub fn with_sender_registry(mut self, senders: Arc<SenderRegistry>) -> Self {
        self.senders = senders;
        self
    }

    pub fn with_settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn router(&self) -> &DestinationRouter {
        &self.router
    }

    pub fn sender_registry(&self) -> &Arc<SenderRegistry> {
        &self.senders
    }

    /// Send every operation.
    ///
    /// Routing and transaction-limit errors are raised before any send.
    /// Otherwise every send runs to completion and the first failure, if
    /// any, is returned.
    pub async fn dispatch(
        &self,
        operations: &[OutgoingOperation],
        binding: Option<&TransactionBinding>,
    ) -> Result<(), DispatchError> {
        let none = TransactionBinding::none();
        let binding = binding.unwrap_or(&none);

        let mut isolated = Vec::new();
        let mut groups: Vec<DestinationGroup<'_>> = Vec::new();
        let mut group_index: HashMap<String, usize> = HashMap::new();
        let mut batchable = 0;

        for operation in operations {
            let resolved = self.router.resolve_operation(operation)?;
            for destination in resolved.names {
                match operation.consistency() {
                    DispatchConsistency::Isolated => isolated.push(IsolatedSend {
                        destination,
                        is_multicast: resolved.is_multicast,
                        operation,
                    }),
                    DispatchConsistency::Default => {
                        batchable += 1;
                        let index = *group_index.entry(destination.clone()).or_insert_with(|| {
                            groups.push(DestinationGroup {
                                destination,
                                is_multicast: resolved.is_multicast,
                                operations: Vec::new(),
                            });
                            groups.len() - 1
                        });
                        groups[index].operations.push(operation);
                    }
                }
            }
        }

        if binding.has_active_transaction() {
            self.settings.check_transaction_limit(batchable)?;
        }

        debug!(
            parent: &self.span,
            isolated = isolated.len(),
            batchable,
            destinations = groups.len(),
            "dispatching"
        );

        let mut sends: Vec<BoxFuture<'_, Result<(), DispatchError>>> = Vec::new();
        for send in isolated {
            sends.push(self.send_isolated(send, binding).boxed());
        }
        for group in groups {
            sends.push(self.send_group(group, binding).boxed());
        }

        join_all(sends)
            .instrument(self.span.clone())
            .await
            .into_iter()
            .collect::<Result<Vec<()>, _>>()
            .map(|_| ())
    }

    /// Close every cached sender.
    pub async fn close(&self) -> Result<(), crate::error::CloseError> {
        self.senders.close_all().await
    }

    async fn send_isolated(
        &self,
        send: IsolatedSend<'_>,
        binding: &TransactionBinding,
    ) -> Result<(), DispatchError> {
        let message = build_message(send.operation, binding.partition_key(), false);
        let result = match self
            .senders
            .get_sender(&send.destination, self.client.as_ref())
            .await
        {
            Ok(sender) => sender.send_message(message, None).await,
            Err(err) => Err(err),
        };
        self.finish_send(&send.destination, send.is_multicast, None, result)
    }

    async fn send_group(
        &self,
        group: DestinationGroup<'_>,
        binding: &TransactionBinding,
    ) -> Result<(), DispatchError> {
        let transactional = binding.has_active_transaction();
        let messages: Vec<BrokerMessage> = group
            .operations
            .iter()
            .map(|op| build_message(op, binding.partition_key(), transactional))
            .collect();

        let client = binding.connection().unwrap_or(&self.client);
        let sender = match self.senders.get_sender(&group.destination, client.as_ref()).await {
            Ok(sender) => sender,
            Err(err) => return self.finish_send(&group.destination, group.is_multicast, None, Err(err)),
        };
        let packed = match pack(sender.as_ref(), messages).await {
            Ok(packed) => packed,
            Err(err) => return self.finish_send(&group.destination, group.is_multicast, None, Err(err)),
        };

        debug!(
            destination = %group.destination,
            batches = packed.batches.len(),
            oversized = packed.oversized.len(),
            "packed messages"
        );

        let batch_results = join_all(packed.batches.into_iter().map(|batch| {
            let scope = binding.scope();
            let sender = Arc::clone(&sender);
            async move {
                let result = sender
                    .send_batch(batch, scope.as_ref().map(TransactionScope::transaction))
                    .await;
                (scope, result)
            }
        }))
        .await;

        let mut first_error = None;
        for (scope, result) in batch_results {
            let outcome = self.finish_send(&group.destination, group.is_multicast, scope, result);
            if let Err(err) = outcome {
                first_error.get_or_insert(err);
            }
        }

        let single_results = join_all(packed.oversized.into_iter().map(|message| {
            let scope = binding.scope();
            let sender = Arc::clone(&sender);
            async move {
                debug!(message_id = %message.message_id, "sending oversized message on its own");
                let result = sender
                    .send_message(message, scope.as_ref().map(TransactionScope::transaction))
                    .await;
                (scope, result)
            }
        }))
        .await;

        for (scope, result) in single_results {
            let outcome = self.finish_send(&group.destination, group.is_multicast, scope, result);
            if let Err(err) = outcome {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Apply the not-found and connectivity policies to one send result.
    ///
    /// The scope is completed for every send that counts as delivered; a
    /// failed send drops it, dooming the ambient transaction.
    fn finish_send(
        &self,
        destination: &str,
        is_multicast: bool,
        scope: Option<TransactionScope>,
        result: Result<(), BrokerError>,
    ) -> Result<(), DispatchError> {
        match result {
            Ok(()) => {}
            Err(err) if is_multicast && err.is_entity_not_found() => {
                warn!(
                    parent: &self.span,
                    destination,
                    "topic not found, publishing to zero subscribers"
                );
            }
            Err(err) => {
                if err.is_connectivity() {
                    error!(parent: &self.span, destination, error = %err, "{}", CONNECTIVITY_GUIDANCE);
                }
                return Err(DispatchError::Send {
                    destination: destination.to_string(),
                    source: err,
                });
            }
        }
        if let Some(scope) = scope {
            scope.complete();
        }
        Ok(())
    }
}

/// Greedily pack messages into as few batches as the sender allows.
///
/// A message refused by a fresh, empty batch can never be batched and is
/// returned in `oversized`. Message order within batches follows input order.
async fn pack(
    sender: &dyn BrokerSender,
    messages: Vec<BrokerMessage>,
) -> Result<Packed, BrokerError> {
    let mut batches = Vec::new();
    let mut oversized = Vec::new();
    let mut batch = sender.create_batch().await?;

    for message in messages {
        if batch.try_add(&message) {
            continue;
        }
        if batch.is_empty() {
            oversized.push(message);
            continue;
        }
        let full = std::mem::replace(&mut batch, sender.create_batch().await?);
        batches.push(full);
        if !batch.try_add(&message) {
            oversized.push(message);
        }
    }
    if !batch.is_empty() {
        batches.push(batch);
    }

    Ok(Packed { batches, oversized })
}

/// Turn an operation into the native message a sender puts on the wire.
fn build_message(
    operation: &OutgoingOperation,
    partition_key: Option<&str>,
    transactional: bool,
) -> BrokerMessage {
    let outgoing = operation.message();
    let properties = operation.properties();
    let mut message = BrokerMessage::new(outgoing.id.clone(), outgoing.body.clone());

    message.application_properties = outgoing.headers.clone();
    message.correlation_id = outgoing.header(headers::CORRELATION_ID).map(str::to_string);
    message.content_type = outgoing.header(headers::CONTENT_TYPE).map(str::to_string);
    message.reply_to = outgoing
        .header(headers::REPLY_TO_ADDRESS)
        .map(str::to_string);
    message.time_to_live = properties.discard_if_not_received_before.or_else(|| {
        outgoing
            .header(headers::TIME_TO_BE_RECEIVED)
            .and_then(|seconds| seconds.parse::<u64>().ok())
            .map(Duration::from_secs)
    });
    message.scheduled_enqueue_time = properties.scheduled_enqueue_time(SystemTime::now());

    if let Some(key) = partition_key {
        message.partition_key = Some(key.to_string());
        if transactional {
            message.transaction_partition_key = Some(key.to_string());
        }
    }

    if let Some(customize) = operation.customizer() {
        customize(&mut message);
    }
    message
}
