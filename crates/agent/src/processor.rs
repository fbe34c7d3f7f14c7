//! Job processor: the AWS IoT Jobs protocol state machine.
//!
//! One probe cycle looks like this:
//!
//! ```text
//! process() ──start-next──▶ start-next/accepted ──execution──▶ run executor
//!                             │                                 │
//!                             └─no execution──▶ done            └─update──▶ update/accepted
//! ```
//!
//! [`JobProcessor::process`] is the only externally driven step. Every
//! other transition happens in [`JobProcessor::handle`], called for each
//! inbound message by the dispatch loop in [`JobProcessor::run`]. That
//! loop is the single serialization point: messages are handled one at a
//! time, so at most one job executes at once. Requests are handed to the
//! [`Publisher`] and never block message handling.
//!
//! Counters are atomics so concurrent callers of `handle` never lose an
//! increment. They are observability only and never gate behaviour.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use autonom_core::messages::{
    parse_next_execution, parse_rejected, StartNextRequest, UpdateRequest,
};
use autonom_core::{Channel, JobExecution, JobExecutionStatus, ProcessorStatus, ThingTopics};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::executor::JobExecutor;
use crate::publisher::{OutboundRequest, Publisher};
use crate::transport::{InboundMessage, JobsTransport, TransportError};

/// How many finished executions are remembered for redelivery detection.
const COMPLETED_MEMORY: usize = 32;

/// Identity of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ExecutionKey {
    job_id: String,
    execution_number: i64,
}

impl ExecutionKey {
    fn of(execution: &JobExecution) -> Self {
        Self {
            job_id: execution.job_id.clone(),
            execution_number: execution.execution_number,
        }
    }
}

/// Drives the notify → start → execute → update protocol for one thing.
pub struct JobProcessor {
    topics: ThingTopics,
    client_token: String,
    executor: Arc<dyn JobExecutor>,
    publisher: Publisher,

    done: AtomicBool,
    started: AtomicU64,
    succeeded: AtomicU64,
    rejected: AtomicU64,

    /// Execution currently inside the executor, if any.
    in_flight: Mutex<Option<ExecutionKey>>,
    /// Recently finished executions and the status reported for each.
    completed: Mutex<VecDeque<(ExecutionKey, JobExecutionStatus)>>,
}

impl JobProcessor {
    /// `client_token` is echoed by the server in every reply; the MQTT
    /// client id is used.
    pub fn new(
        topics: ThingTopics,
        client_token: impl Into<String>,
        executor: Arc<dyn JobExecutor>,
        publisher: Publisher,
    ) -> Self {
        Self {
            topics,
            client_token: client_token.into(),
            executor,
            publisher,
            done: AtomicBool::new(false),
            started: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            in_flight: Mutex::new(None),
            completed: Mutex::new(VecDeque::with_capacity(COMPLETED_MEMORY)),
        }
    }

    pub fn topics(&self) -> &ThingTopics {
        &self.topics
    }

    /// Subscribe to all five reply channels.
    pub async fn subscribe(&self, transport: &dyn JobsTransport) -> Result<(), TransportError> {
        for channel in Channel::ALL {
            let filter = self.topics.subscription(channel);
            transport.subscribe(&filter).await?;
            tracing::info!(channel = %channel, filter = %filter, "Subscribed to job channel");
        }
        Ok(())
    }

    /// Start a probe cycle: clear `done` and ask for the next execution.
    pub fn process(&self) {
        self.done.store(false, Ordering::SeqCst);
        self.start_next();
    }

    /// Whether the latest probe found no pending execution.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Snapshot of the counters.
    pub fn status(&self) -> ProcessorStatus {
        ProcessorStatus {
            jobs_started: self.started.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Job id of the execution currently running, if any.
    pub fn in_flight(&self) -> Option<String> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|key| key.job_id.clone())
    }

    /// Dispatch loop: handle inbound messages one at a time until
    /// cancelled or the transport drops its sender.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = inbound.recv() => match message {
                    // A job interrupted by shutdown is left unreported; the
                    // next start-next after restart hands it out again.
                    Some(message) => tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.handle(&message) => {}
                    },
                    None => {
                        tracing::info!("Inbound channel closed");
                        break;
                    }
                },
            }
        }
        tracing::info!(status = ?self.status(), "Job processor stopped");
    }

    /// Apply one inbound message.
    pub async fn handle(&self, message: &InboundMessage) {
        let Some(channel) = self.topics.classify(&message.topic) else {
            tracing::debug!(topic = %message.topic, "Ignoring message on unknown topic");
            return;
        };
        tracing::debug!(channel = %channel, "Job message received");

        match channel {
            Channel::NotifyNext => self.on_notify_next(&message.payload),
            Channel::StartNextAccepted => self.on_start_next_accepted(&message.payload).await,
            Channel::StartNextRejected => self.on_start_next_rejected(&message.payload),
            Channel::UpdateAccepted => self.on_update_accepted(&message.topic),
            Channel::UpdateRejected => self.on_update_rejected(&message.topic, &message.payload),
        }
    }

    // ---- channel handlers ----

    fn on_notify_next(&self, payload: &[u8]) {
        match parse_next_execution(payload) {
            Ok(reply) if reply.has_execution() => {
                tracing::info!("Notify next saw an execution, requesting it");
                self.start_next();
            }
            Ok(_) => {
                tracing::info!("Notify next saw no execution");
                self.mark_done();
            }
            Err(e) => {
                tracing::warn!(error = %e, raw = %String::from_utf8_lossy(payload), "Dropping malformed notify-next payload");
            }
        }
    }

    async fn on_start_next_accepted(&self, payload: &[u8]) {
        let reply = match parse_next_execution(payload) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, raw = %String::from_utf8_lossy(payload), "Dropping malformed start-next reply");
                return;
            }
        };

        let Some(raw) = reply.execution else {
            tracing::info!("Start next saw no execution");
            self.mark_done();
            return;
        };

        let (execution, update_topic) = match JobExecution::from_value(&raw)
            .and_then(|execution| {
                let topic = self.topics.update(&execution.job_id)?;
                Ok((execution, topic))
            }) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, execution = %raw, "Start next returned an unusable execution");
                self.mark_done();
                return;
            }
        };

        self.started.fetch_add(1, Ordering::Relaxed);
        let key = ExecutionKey::of(&execution);

        let status = match self.completed_status(&key) {
            Some(status) => {
                tracing::info!(
                    job_id = %execution.job_id,
                    execution_number = execution.execution_number,
                    version_number = execution.version_number,
                    status = %status,
                    "Execution already ran, re-reporting its status",
                );
                status
            }
            None => {
                let status = JobExecutionStatus::from_outcome(self.execute(&execution).await);
                self.remember_completed(key, status);
                status
            }
        };

        self.report(&execution, update_topic, status);
    }

    fn on_start_next_rejected(&self, payload: &[u8]) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        let reply = parse_rejected(payload).unwrap_or_default();
        tracing::warn!(
            code = reply.code.as_deref().unwrap_or("unknown"),
            message = reply.message.as_deref().unwrap_or(""),
            "Start next rejected",
        );
    }

    fn on_update_accepted(&self, topic: &str) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            job_id = self.topics.update_job_id(topic).unwrap_or("unknown"),
            "Status update accepted",
        );
    }

    fn on_update_rejected(&self, topic: &str, payload: &[u8]) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        let reply = parse_rejected(payload).unwrap_or_default();
        tracing::warn!(
            job_id = self.topics.update_job_id(topic).unwrap_or("unknown"),
            code = reply.code.as_deref().unwrap_or("unknown"),
            message = reply.message.as_deref().unwrap_or(""),
            "Status update rejected",
        );
    }

    // ---- execution ----

    /// Run the executor on its own task so that an error or a panic is
    /// contained and reported as a failure.
    async fn execute(&self, execution: &JobExecution) -> bool {
        tracing::info!(
            job_id = %execution.job_id,
            version_number = execution.version_number,
            execution_number = execution.execution_number,
            "Executing job",
        );
        tracing::debug!(job_document = %execution.job_document, "Job document");

        self.set_in_flight(Some(ExecutionKey::of(execution)));

        let executor = Arc::clone(&self.executor);
        let document = execution.job_document.clone();
        let outcome = tokio::spawn(async move { executor.execute(&document).await }).await;

        self.set_in_flight(None);

        match outcome {
            Ok(Ok(succeeded)) => {
                tracing::info!(job_id = %execution.job_id, succeeded, "Job finished");
                succeeded
            }
            Ok(Err(e)) => {
                tracing::error!(job_id = %execution.job_id, error = %e, "Failed to execute job");
                false
            }
            Err(e) => {
                tracing::error!(job_id = %execution.job_id, error = %e, "Job executor aborted");
                false
            }
        }
    }

    fn set_in_flight(&self, key: Option<ExecutionKey>) {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = key;
    }

    fn completed_status(&self, key: &ExecutionKey) -> Option<JobExecutionStatus> {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, status)| *status)
    }

    fn remember_completed(&self, key: ExecutionKey, status: JobExecutionStatus) {
        let mut completed = self.completed.lock().unwrap_or_else(PoisonError::into_inner);
        if completed.len() == COMPLETED_MEMORY {
            completed.pop_front();
        }
        completed.push_back((key, status));
    }

    // ---- outbound requests ----

    fn start_next(&self) {
        let body = StartNextRequest::new(&self.client_token, Utc::now());
        self.send(self.topics.start_next(), &body);
    }

    fn report(&self, execution: &JobExecution, topic: String, status: JobExecutionStatus) {
        tracing::info!(
            job_id = %execution.job_id,
            status = %status,
            expected_version = execution.version_number,
            "Reporting job status",
        );
        let body = UpdateRequest::new(execution, status, &self.client_token, Utc::now());
        self.send(topic, &body);
    }

    fn send<T: Serialize>(&self, topic: String, body: &T) {
        let payload = match serde_json::to_vec(body) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "Failed to serialize request");
                return;
            }
        };
        if let Err(e) = self.publisher.enqueue(OutboundRequest { topic, payload }) {
            tracing::error!(error = %e, "Failed to queue request");
        }
    }

    fn mark_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }
}
