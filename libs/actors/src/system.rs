//! Actor System
//!
//! Launches a graph plan: builds one actor per task descriptor, binds each
//! actor to one worker thread for its whole lifetime and starts the
//! sources. Worker threads are plain OS threads draining a tokio channel
//! with `blocking_recv`, so an actor's messages are processed strictly one
//! at a time on the same thread.
//!
//! The `GraphHandle` returned by `launch` is the graph-level controller. It
//! receives a `ControllerEvent` whenever an actor terminates, fails or
//! reports a transfer failure, fails fast on fatal errors and applies the
//! configured `ControllerPolicy` to transfer failures.
//!
//! # Teardown
//!
//! Every worker receives `Envelope::Stop` once the graph finished (or
//! failed); the worker exits after the messages queued ahead of it. Any
//! payload still exported to the transport is withdrawn.

use crate::actor::Actor;
use crate::bus::{Envelope, Inbox, MessageBus};
use crate::context::WorkerContext;
use crate::error::{ActorError, Result};
use crate::kernel::KernelRegistry;
use crate::messages::{ActorCommand, ActorMessage};
use crate::metrics::{ActorMetrics, ActorStats};
use config::{GraphPlan, RuntimeConfig};
use network::{Transport, TransportStats};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use types::{ActorId, PieceId, WorkerId};

/// Sender id used for controller commands
pub const CONTROLLER: ActorId = ActorId(u64::MAX);

/// Reports from worker threads to the graph controller
#[derive(Debug)]
pub enum ControllerEvent {
    Terminated { actor: ActorId },
    /// A fatal error; the actor processes no further messages
    Failed { actor: ActorId, error: ActorError },
    /// A transfer failed; the actor is alive and holds the piece
    TransferFailed { actor: ActorId, error: ActorError },
}

/// What the controller does with a transfer failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerPolicy {
    #[default]
    AbortOnTransferError,
    /// Resubmit the failed piece up to `max_attempts` times
    ResubmitTransfers { max_attempts: u32 },
}

#[derive(Debug, Error)]
pub enum GraphFailure {
    #[error("Graph aborted: {0}")]
    Actor(#[from] ActorError),

    #[error("Graph did not finish within {timeout:?}; still running: {pending:?}")]
    Timeout {
        timeout: Duration,
        pending: Vec<ActorId>,
    },

    #[error("All workers exited before the graph finished")]
    WorkersExited,

    #[error("{worker} panicked")]
    WorkerPanicked { worker: WorkerId },
}

/// Outcome of a finished graph
#[derive(Debug, Clone)]
pub struct GraphReport {
    pub elapsed: Duration,
    pub actors: BTreeMap<ActorId, ActorStats>,
    pub transport: TransportStats,
    pub messages_sent: u64,
    pub cross_node_sends: u64,
    pub transfer_failures: u64,
    pub resubmitted: u64,
}

pub struct ActorSystem {
    config: RuntimeConfig,
    transport: Arc<dyn Transport>,
    kernels: KernelRegistry,
    policy: ControllerPolicy,
}

impl ActorSystem {
    pub fn new(config: RuntimeConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            kernels: KernelRegistry::new(),
            policy: ControllerPolicy::default(),
        }
    }

    pub fn with_kernels(mut self, kernels: KernelRegistry) -> Self {
        self.kernels = kernels;
        self
    }

    pub fn with_policy(mut self, policy: ControllerPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Validate the plan, build every actor, spawn the workers and start
    /// the sources
    pub fn launch(&self, plan: &GraphPlan) -> Result<GraphHandle> {
        let default_depth = self.config.default_pipeline_depth;
        plan.validate(default_depth)?;

        let mut actors = Vec::with_capacity(plan.tasks.len());
        for task in &plan.tasks {
            actors.push(Actor::init(
                task,
                default_depth,
                &self.kernels,
                Arc::clone(&self.transport),
            )?);
        }

        let worker_count = self.config.worker_threads.clamp(1, actors.len().max(1));
        let mut inboxes = Vec::with_capacity(worker_count);
        let mut receivers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, rx) = mpsc::unbounded_channel();
            inboxes.push(tx);
            receivers.push(rx);
        }

        let mut bus = MessageBus::new(Arc::clone(&self.transport));
        let mut assigned: Vec<HashMap<ActorId, Actor>> =
            (0..worker_count).map(|_| HashMap::new()).collect();
        let mut metrics = HashMap::with_capacity(actors.len());
        let mut sources = Vec::new();

        for (i, actor) in actors.into_iter().enumerate() {
            let worker = i % worker_count;
            bus.add_route(
                actor.id(),
                actor.node(),
                WorkerId(worker as u32),
                inboxes[worker].clone(),
            );
            metrics.insert(actor.id(), actor.metrics());
            if actor.is_source() {
                sources.push(actor.id());
            }
            assigned[worker].insert(actor.id(), actor);
        }
        let bus = Arc::new(bus);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut workers = Vec::with_capacity(worker_count);
        for (index, (actors, inbox)) in assigned.into_iter().zip(receivers).enumerate() {
            let worker = WorkerId(index as u32);
            let bus = Arc::clone(&bus);
            let events = events_tx.clone();
            let thread = std::thread::Builder::new()
                .name(format!("actor-worker-{index}"))
                .spawn(move || run_worker(worker, actors, inbox, bus, events))
                .map_err(|e| ActorError::protocol(CONTROLLER, format!("failed to spawn {worker}: {e}")))?;
            workers.push(WorkerThread {
                worker,
                inbox: inboxes[index].clone(),
                thread: Some(thread),
            });
        }

        info!(
            plan = plan.name.as_deref().unwrap_or("unnamed"),
            actors = metrics.len(),
            workers = worker_count,
            sources = sources.len(),
            "Graph launched"
        );

        let handle = GraphHandle {
            bus,
            events: events_rx,
            workers,
            metrics,
            transport: Arc::clone(&self.transport),
            policy: self.policy,
            timeout: self.config.shutdown_timeout(),
            started: Instant::now(),
        };

        for source in sources {
            handle
                .bus
                .send(ActorMessage::command(CONTROLLER, source, ActorCommand::Start))?;
        }
        Ok(handle)
    }
}

struct WorkerThread {
    worker: WorkerId,
    inbox: Inbox,
    thread: Option<JoinHandle<()>>,
}

/// Worker loop: one message at a time for the actors bound to this thread
fn run_worker(
    worker: WorkerId,
    mut actors: HashMap<ActorId, Actor>,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    bus: Arc<MessageBus>,
    events: mpsc::UnboundedSender<ControllerEvent>,
) {
    debug!(worker = %worker, actors = actors.len(), "Worker started");
    let mut ctx = WorkerContext::new(worker, bus);
    let mut failed: HashSet<ActorId> = HashSet::new();
    let mut terminated: HashSet<ActorId> = HashSet::new();

    while let Some(envelope) = inbox.blocking_recv() {
        let msg = match envelope {
            Envelope::Message(msg) => msg,
            Envelope::Stop => break,
        };
        let dst = msg.dst;
        let Some(actor) = actors.get_mut(&dst) else {
            warn!(worker = %worker, actor_id = %dst, "Message for an actor not on this worker");
            continue;
        };
        if failed.contains(&dst) {
            debug!(actor_id = %dst, message = %msg, "Dropping message for failed actor");
            continue;
        }

        let event = match actor.process_message(msg, &mut ctx) {
            Ok(()) if actor.is_terminal() && terminated.insert(dst) => {
                Some(ControllerEvent::Terminated { actor: dst })
            }
            Ok(()) => None,
            Err(error) if error.is_fatal() => {
                failed.insert(dst);
                Some(ControllerEvent::Failed { actor: dst, error })
            }
            Err(error) => Some(ControllerEvent::TransferFailed { actor: dst, error }),
        };
        if let Some(event) = event {
            // The controller may already be gone during teardown
            let _ = events.send(event);
        }
    }
    debug!(worker = %worker, "Worker stopped");
}

/// Controller side of a launched graph
pub struct GraphHandle {
    bus: Arc<MessageBus>,
    events: mpsc::UnboundedReceiver<ControllerEvent>,
    workers: Vec<WorkerThread>,
    metrics: HashMap<ActorId, Arc<ActorMetrics>>,
    transport: Arc<dyn Transport>,
    policy: ControllerPolicy,
    timeout: Duration,
    started: Instant,
}

impl GraphHandle {
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn actors(&self) -> impl Iterator<Item = ActorId> + '_ {
        self.metrics.keys().copied()
    }

    /// Wait up to the configured shutdown timeout
    pub async fn wait(self) -> std::result::Result<GraphReport, GraphFailure> {
        let timeout = self.timeout;
        self.wait_timeout(timeout).await
    }

    pub async fn wait_timeout(
        mut self,
        timeout: Duration,
    ) -> std::result::Result<GraphReport, GraphFailure> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut remaining: HashSet<ActorId> = self.metrics.keys().copied().collect();
        let mut attempts: HashMap<(ActorId, PieceId), u32> = HashMap::new();
        let mut transfer_failures = 0;
        let mut resubmitted = 0;

        let outcome = loop {
            if remaining.is_empty() {
                break Ok(());
            }
            let event = match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => break Err(GraphFailure::WorkersExited),
                Err(_) => {
                    let mut pending: Vec<_> = remaining.iter().copied().collect();
                    pending.sort();
                    break Err(GraphFailure::Timeout { timeout, pending });
                }
            };

            match event {
                ControllerEvent::Terminated { actor } => {
                    remaining.remove(&actor);
                    debug!(actor_id = %actor, remaining = remaining.len(), "Actor finished");
                }
                ControllerEvent::Failed { actor, error } => {
                    error!(actor_id = %actor, category = error.category(), error = %error, "Aborting graph");
                    break Err(GraphFailure::Actor(error));
                }
                ControllerEvent::TransferFailed { actor, error } => {
                    transfer_failures += 1;
                    match self.on_transfer_failed(actor, error, &mut attempts) {
                        Ok(()) => resubmitted += 1,
                        Err(failure) => break Err(failure),
                    }
                }
            }
        };

        let report = self.finish(transfer_failures, resubmitted).await;
        match (outcome, report) {
            (Ok(()), Ok(report)) => {
                info!(
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    messages = report.messages_sent,
                    transfers = report.transport.transfers_completed,
                    "Graph finished"
                );
                Ok(report)
            }
            (Err(failure), _) | (Ok(()), Err(failure)) => Err(failure),
        }
    }

    fn on_transfer_failed(
        &self,
        actor: ActorId,
        error: ActorError,
        attempts: &mut HashMap<(ActorId, PieceId), u32>,
    ) -> std::result::Result<(), GraphFailure> {
        let ControllerPolicy::ResubmitTransfers { max_attempts } = self.policy else {
            error!(actor_id = %actor, error = %error, "Transfer failed, aborting graph");
            return Err(GraphFailure::Actor(error));
        };
        let ActorError::Transfer { piece, .. } = &error else {
            return Err(GraphFailure::Actor(error));
        };
        let piece = *piece;

        let attempt = attempts.entry((actor, piece)).or_insert(0);
        *attempt += 1;
        if *attempt > max_attempts {
            error!(actor_id = %actor, piece = %piece, attempts = *attempt - 1, "Transfer retries exhausted");
            return Err(GraphFailure::Actor(error));
        }

        warn!(actor_id = %actor, piece = %piece, attempt = *attempt, error = %error, "Resubmitting transfer");
        self.bus.send(ActorMessage::command(
            CONTROLLER,
            actor,
            ActorCommand::ResubmitTransfer { piece },
        ))?;
        Ok(())
    }

    /// Tear the graph down without waiting for it to finish
    pub async fn abort(self) -> std::result::Result<GraphReport, GraphFailure> {
        info!("Aborting graph");
        self.finish(0, 0).await
    }

    /// Stop every worker, withdraw leftover exports and collect metrics
    async fn finish(
        mut self,
        transfer_failures: u64,
        resubmitted: u64,
    ) -> std::result::Result<GraphReport, GraphFailure> {
        for worker in &self.workers {
            let _ = worker.inbox.send(Envelope::Stop);
        }

        let mut panicked = None;
        for worker in &mut self.workers {
            let Some(thread) = worker.thread.take() else {
                continue;
            };
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                error!(worker = %worker.worker, "Worker thread panicked");
                panicked.get_or_insert(worker.worker);
            }
        }

        let released = self.bus.release_exports();
        if released > 0 {
            debug!(released, "Withdrew exports left by unfinished transfers");
        }

        if let Some(worker) = panicked {
            return Err(GraphFailure::WorkerPanicked { worker });
        }

        Ok(GraphReport {
            elapsed: self.started.elapsed(),
            actors: self
                .metrics
                .iter()
                .map(|(id, metrics)| (*id, metrics.snapshot()))
                .collect(),
            transport: self.transport.metrics().snapshot(),
            messages_sent: self.bus.messages_sent(),
            cross_node_sends: self.bus.cross_node_sends(),
            transfer_failures,
            resubmitted,
        })
    }
}

impl Drop for GraphHandle {
    fn drop(&mut self) {
        for worker in &self.workers {
            if worker.thread.is_some() {
                let _ = worker.inbox.send(Envelope::Stop);
            }
        }
    }
}
