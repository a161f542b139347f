//! Dispatcher: routes a channel's inbound stream onto per-conversation queues.
//!
//! Each conversation gets a FIFO worker that runs its turns one at a time;
//! different conversations run in parallel. Workers are spawned on demand
//! and exit once their queue is drained. Commands queue like messages, so a
//! reset only clears what arrived before it. Stop bypasses the queue so it
//! can reach a turn that is already running, and a permitted reset cancels
//! the running turn as soon as it arrives.

use dashmap::DashMap;
use gemcord_core::channel::{Channel, InboundEvent, OutboundMessage};
use gemcord_core::error::ChannelError;
use gemcord_core::event::EventBus;
use gemcord_core::message::ConversationId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunker::chunk;
use crate::orchestrator::{Command, Orchestrator, Reply};

struct Eviction {
    idle_timeout: Duration,
    interval: Duration,
    event_bus: Arc<EventBus>,
}

pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    channel: Arc<dyn Channel>,
    workers: DashMap<ConversationId, mpsc::UnboundedSender<InboundEvent>>,
    tasks: Mutex<JoinSet<()>>,
    max_message_length: usize,
    eviction: Option<Eviction>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>, channel: Arc<dyn Channel>) -> Self {
        Self {
            orchestrator,
            channel,
            workers: DashMap::new(),
            tasks: Mutex::new(JoinSet::new()),
            max_message_length: 2000,
            eviction: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Platform limit for one outbound text message, in characters.
    pub fn with_max_message_length(mut self, max: usize) -> Self {
        self.max_message_length = max;
        self
    }

    /// Sweep idle sessions every `interval` while running.
    pub fn with_eviction(
        mut self,
        idle_timeout: Duration,
        interval: Duration,
        event_bus: Arc<EventBus>,
    ) -> Self {
        self.eviction = Some(Eviction {
            idle_timeout,
            interval,
            event_bus,
        });
        self
    }

    /// Cancelling this token stops the dispatcher and every running turn.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Consume the channel until it closes or shutdown is requested.
    ///
    /// Queued turns are allowed to finish before this returns.
    pub async fn run(self: Arc<Self>) -> Result<(), ChannelError> {
        let mut inbound = self.channel.start().await?;
        info!(channel = %self.channel.name(), "Dispatcher started");

        let eviction_stop = self.shutdown.child_token();
        let eviction = self.eviction.as_ref().map(|e| {
            self.orchestrator.sessions().spawn_eviction(
                e.idle_timeout,
                e.interval,
                e.event_bus.clone(),
                eviction_stop.clone(),
            )
        });

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    self.orchestrator.sessions().shutdown();
                    break;
                }
                next = inbound.recv() => match next {
                    Some(Ok(event)) => self.route(event).await,
                    Some(Err(e)) => warn!(channel = %self.channel.name(), error = %e, "Inbound error"),
                    None => {
                        info!(channel = %self.channel.name(), "Inbound stream closed");
                        break;
                    }
                },
            }
        }

        // Dropping the senders lets each worker exit after its queue drains.
        self.workers.clear();
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        while tasks.join_next().await.is_some() {}

        eviction_stop.cancel();
        if let Some(handle) = eviction {
            let _ = handle.await;
        }

        self.channel.stop().await?;
        info!("Dispatcher stopped");
        Ok(())
    }

    async fn route(self: &Arc<Self>, event: InboundEvent) {
        if !self.channel.is_allowed(&event.author_id) {
            debug!(author = %event.author_id, "Ignoring message from disallowed author");
            return;
        }

        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}

        let id = event.conversation_id.clone();
        match Command::parse(&event.text) {
            Some(Command::Stop) => {
                debug!(conversation_id = %id, "Stop command");
                let this = Arc::clone(self);
                tasks.spawn(async move {
                    if let Some(reply) = this.orchestrator.handle_command(&event, Command::Stop).await {
                        this.deliver(&event, reply).await;
                    }
                });
                return;
            }
            Some(Command::Reset) if self.orchestrator.may_configure(&id, &event.author_id) => {
                self.orchestrator.sessions().cancel(&id);
            }
            _ => {}
        }

        let event = match self.workers.get(&id) {
            Some(queue) => match queue.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let (queue, rx) = mpsc::unbounded_channel();
        // The receiver is alive, so this cannot fail.
        let _ = queue.send(event);
        self.workers.insert(id.clone(), queue);
        tasks.spawn(Arc::clone(self).worker(id, rx));
    }

    async fn worker(self: Arc<Self>, id: ConversationId, mut rx: mpsc::UnboundedReceiver<InboundEvent>) {
        debug!(conversation_id = %id, "Conversation worker started");
        loop {
            let event = match rx.try_recv() {
                Ok(event) => event,
                Err(mpsc::error::TryRecvError::Empty) => {
                    // Retire under the map's lock so no message slips in unseen.
                    if self.workers.remove_if(&id, |_, _| rx.is_empty()).is_some() {
                        break;
                    }
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            };

            if let Some(command) = Command::parse(&event.text) {
                debug!(conversation_id = %id, ?command, "Control command");
                if let Some(reply) = self.orchestrator.handle_command(&event, command).await {
                    self.deliver(&event, reply).await;
                }
                continue;
            }

            if let Err(e) = self.channel.send_typing(&id).await {
                debug!(conversation_id = %id, error = %e, "Typing indicator failed");
            }
            let reply = self.orchestrator.handle(event.clone()).await;
            self.deliver(&event, reply).await;
        }
        debug!(conversation_id = %id, "Conversation worker exited");
    }

    /// Send a reply chunk by chunk, stopping at the first delivery failure.
    async fn deliver(&self, event: &InboundEvent, reply: Reply) {
        let id = &event.conversation_id;
        let mut sent = 0usize;
        for payload in chunk(reply.text, reply.media, self.max_message_length) {
            let message = OutboundMessage {
                conversation_id: id.clone(),
                reply_to: event.message_id.clone(),
                payload,
            };
            if let Err(e) = self.channel.send(&message).await {
                warn!(conversation_id = %id, error = %e, sent, "Reply delivery failed");
                return;
            }
            sent += 1;
        }
        debug!(conversation_id = %id, chunks = sent, "Reply delivered");
    }
}
