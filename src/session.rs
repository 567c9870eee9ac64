//! The event loop that drives one `SyncEngine` against a remote store.
//!
//! A single task owns the engine. User intents, feed events, command
//! responses and timers are multiplexed with `tokio::select!`, so every engine
//! call runs to completion before the next event is looked at.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::stream::{BoxStream, FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, instrument, warn};

use crate::engine::{CommitMode, FailureNotice, NewEntry, SyncEngine};
use crate::error::SyncError;
use crate::model::{ChangeEvent, Command, Entry, EntryId, EntryStatus, PendingOperation};
use crate::remote::RemoteStore;

#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Add(NewEntry),
    EditQuantity {
        id: EntryId,
        quantity: String,
        mode: CommitMode,
    },
    SetStatus {
        id: EntryId,
        status: EntryStatus,
    },
    Delete {
        id: EntryId,
    },
    DragEnd {
        from: usize,
        to: usize,
    },
    Reload,
}

impl Intent {
    pub fn label(&self) -> &'static str {
        match self {
            Intent::Add(_) => "add",
            Intent::EditQuantity { .. } => "edit_quantity",
            Intent::SetStatus { .. } => "set_status",
            Intent::Delete { .. } => "delete",
            Intent::DragEnd { .. } => "drag_end",
            Intent::Reload => "reload",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    CommandFailed(FailureNotice),
    /// The intent was invalid; nothing was applied or sent.
    Rejected {
        intent: &'static str,
        error: SyncError,
    },
    ReloadFailed {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Idle,
    Connecting,
    Live,
    Error,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub reconnect_base: Duration,
    pub max_backoff: Duration,
    pub stale_op_after: Duration,
    pub channel_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            stale_op_after: Duration::from_secs(30),
            channel_capacity: 64,
        }
    }
}

/// Capped exponential backoff: `min(base * 2^attempt, cap)`.
pub fn reconnect_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(31));
    base.saturating_mul(factor).min(cap)
}

/// Cheap-to-clone front door for the presentation layer.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    intents: mpsc::Sender<Intent>,
    entries: watch::Receiver<Vec<Entry>>,
    pending: watch::Receiver<Vec<PendingOperation>>,
    saving: watch::Receiver<BTreeSet<EntryId>>,
    feed_status: watch::Receiver<FeedStatus>,
}

impl SessionHandle {
    pub async fn send(&self, intent: Intent) -> Result<()> {
        self.intents
            .send(intent)
            .await
            .context("session has shut down")
    }

    /// Entries in display order, as last published.
    pub fn entries(&self) -> Vec<Entry> {
        self.entries.borrow().clone()
    }

    pub fn is_saving(&self, id: &EntryId) -> bool {
        self.saving.borrow().contains(id)
    }

    pub fn pending(&self) -> Vec<PendingOperation> {
        self.pending.borrow().clone()
    }

    pub fn feed_status(&self) -> FeedStatus {
        *self.feed_status.borrow()
    }

    pub fn watch_entries(&self) -> watch::Receiver<Vec<Entry>> {
        self.entries.clone()
    }

    pub fn watch_pending(&self) -> watch::Receiver<Vec<PendingOperation>> {
        self.pending.clone()
    }

    pub fn watch_saving(&self) -> watch::Receiver<BTreeSet<EntryId>> {
        self.saving.clone()
    }

    pub fn watch_feed_status(&self) -> watch::Receiver<FeedStatus> {
        self.feed_status.clone()
    }
}

type InFlight = BoxFuture<'static, (Command, Result<()>)>;

pub struct Session {
    engine: SyncEngine,
    remote: Arc<dyn RemoteStore>,
    settings: SessionSettings,
    intents: mpsc::Receiver<Intent>,
    notices: mpsc::Sender<Notice>,
    saving_tx: watch::Sender<BTreeSet<EntryId>>,
    feed_tx: watch::Sender<FeedStatus>,
    feed: Option<BoxStream<'static, ChangeEvent>>,
    in_flight: FuturesUnordered<InFlight>,
    reconnect_at: Option<Instant>,
    reconnect_attempt: u32,
    next_sweep: Instant,
}

impl Session {
    /// Start the event loop on the current runtime.
    ///
    /// The loop exits once every `SessionHandle` is dropped, after flushing
    /// scheduled commits and waiting for in-flight ones.
    pub fn spawn(
        mut engine: SyncEngine,
        remote: Arc<dyn RemoteStore>,
        settings: SessionSettings,
    ) -> (SessionHandle, mpsc::Receiver<Notice>, JoinHandle<Result<()>>) {
        let capacity = settings.channel_capacity.max(1);
        let (intent_tx, intent_rx) = mpsc::channel(capacity);
        let (notice_tx, notice_rx) = mpsc::channel(capacity);

        let (entries_tx, entries_rx) = watch::channel(engine.entries().to_vec());
        engine.subscribe_entries(Box::new(move |entries: &[Entry]| {
            entries_tx.send_replace(entries.to_vec());
        }));
        let (pending_tx, pending_rx) = watch::channel(engine.registry().list().to_vec());
        engine.subscribe_pending(Box::new(move |ops: &[PendingOperation]| {
            pending_tx.send_replace(ops.to_vec());
        }));
        let (saving_tx, saving_rx) = watch::channel(BTreeSet::new());
        let (feed_tx, feed_rx) = watch::channel(FeedStatus::Idle);

        let handle = SessionHandle {
            intents: intent_tx,
            entries: entries_rx,
            pending: pending_rx,
            saving: saving_rx,
            feed_status: feed_rx,
        };
        let next_sweep = Instant::now() + settings.stale_op_after;
        let session = Session {
            engine,
            remote,
            settings,
            intents: intent_rx,
            notices: notice_tx,
            saving_tx,
            feed_tx,
            feed: None,
            in_flight: FuturesUnordered::new(),
            reconnect_at: None,
            reconnect_attempt: 0,
            next_sweep,
        };
        let task = tokio::spawn(session.run());
        (handle, notice_rx, task)
    }

    #[instrument(skip_all, fields(scope = %self.engine.scope()))]
    async fn run(mut self) -> Result<()> {
        self.start().await?;

        loop {
            let wake = [
                self.engine.next_deadline(),
                self.engine.next_saving_expiry(),
                self.reconnect_at,
                Some(self.next_sweep),
            ]
            .into_iter()
            .flatten()
            .min();

            tokio::select! {
                intent = self.intents.recv() => match intent {
                    Some(intent) => self.handle_intent(intent).await,
                    None => break,
                },
                event = next_event(&mut self.feed) => match event {
                    Some(event) => {
                        self.engine.reconcile(event, Instant::now());
                    }
                    None => self.feed_dropped(),
                },
                Some((command, result)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.complete(command, result);
                }
                _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {}
            }

            self.on_timers().await;
            self.publish_saving();
        }

        self.shutdown().await;
        Ok(())
    }

    /// Subscribe before loading so nothing written in between is missed.
    async fn start(&mut self) -> Result<()> {
        let scope = self.engine.scope().clone();
        self.feed_tx.send_replace(FeedStatus::Connecting);
        let subscribed = self.engine.bridge().subscribe(self.remote.as_ref()).await;
        match subscribed {
            Ok(feed) => {
                self.feed = Some(feed);
                self.feed_tx.send_replace(FeedStatus::Live);
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "feed subscribe failed");
                self.feed_tx.send_replace(FeedStatus::Error);
                self.schedule_reconnect();
            }
        }
        let rows = self
            .remote
            .load(&scope)
            .await
            .with_context(|| format!("initial load of {scope} failed"))?;
        info!(rows = rows.len(), "session started");
        self.engine.replace_all(rows);
        Ok(())
    }

    async fn handle_intent(&mut self, intent: Intent) {
        let label = intent.label();
        let result = match intent {
            Intent::Add(new) => self.engine.add_entry(new).map(Some),
            Intent::EditQuantity { id, quantity, mode } => {
                self.engine.edit_quantity(&id, &quantity, mode)
            }
            Intent::SetStatus { id, status } => self.engine.set_status(&id, status).map(Some),
            Intent::Delete { id } => self.engine.delete_entry(&id).map(Some),
            Intent::DragEnd { from, to } => self.engine.drag_end(from, to),
            Intent::Reload => {
                self.reload().await;
                return;
            }
        };
        match result {
            Ok(Some(command)) => self.dispatch(command),
            Ok(None) => {}
            Err(error) => {
                debug!(intent = label, %error, "intent rejected");
                self.notify(Notice::Rejected {
                    intent: label,
                    error,
                });
            }
        }
    }

    fn dispatch(&mut self, command: Command) {
        debug!(op_id = %command.op_id, kind = command.kind().as_str(), "submit");
        let remote = Arc::clone(&self.remote);
        self.in_flight.push(
            async move {
                let result = remote.submit(&command).await;
                (command, result)
            }
            .boxed(),
        );
    }

    fn complete(&mut self, command: Command, result: Result<()>) {
        let now = Instant::now();
        match result {
            Ok(()) => self.engine.on_command_succeeded(command.op_id, now),
            Err(err) => {
                if let Some(notice) =
                    self.engine
                        .on_command_failed(command.op_id, format!("{err:#}"), now)
                {
                    self.notify(Notice::CommandFailed(notice));
                }
            }
        }
    }

    async fn on_timers(&mut self) {
        let now = Instant::now();
        for command in self.engine.fire_due(now) {
            self.dispatch(command);
        }
        self.engine.prune_saving(now);
        if now >= self.next_sweep {
            self.engine.sweep_stale(self.settings.stale_op_after);
            self.next_sweep = now + self.settings.stale_op_after;
        }
        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect().await;
        }
    }

    fn feed_dropped(&mut self) {
        warn!("change feed ended");
        self.feed = None;
        self.feed_tx.send_replace(FeedStatus::Error);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let delay = reconnect_delay(
            self.settings.reconnect_base,
            self.reconnect_attempt,
            self.settings.max_backoff,
        );
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        self.reconnect_at = Some(Instant::now() + delay);
        info!(attempt = self.reconnect_attempt, delay_ms = delay.as_millis() as u64, "feed reconnect scheduled");
    }

    async fn reconnect(&mut self) {
        self.reconnect_at = None;
        self.feed_tx.send_replace(FeedStatus::Connecting);
        let subscribed = self.engine.bridge().subscribe(self.remote.as_ref()).await;
        match subscribed {
            Ok(feed) => {
                info!(attempts = self.reconnect_attempt, "change feed reconnected");
                self.feed = Some(feed);
                self.reconnect_attempt = 0;
                self.feed_tx.send_replace(FeedStatus::Live);
                // Anything broadcast while we were away is gone; catch up.
                self.reload().await;
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "feed reconnect failed");
                self.feed_tx.send_replace(FeedStatus::Error);
                self.schedule_reconnect();
            }
        }
    }

    async fn reload(&mut self) {
        let scope = self.engine.scope().clone();
        match self.remote.load(&scope).await {
            Ok(rows) => self.engine.reload(rows),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(error = %message, "reload failed");
                self.notify(Notice::ReloadFailed { message });
            }
        }
    }

    fn publish_saving(&self) {
        let visible = self.engine.saving_entities(Instant::now());
        self.saving_tx.send_if_modified(|current| {
            if *current == visible {
                return false;
            }
            *current = visible;
            true
        });
    }

    fn notify(&self, notice: Notice) {
        // A reader that stopped draining must not stall the loop.
        if let Err(err) = self.notices.try_send(notice) {
            warn!(error = %err, "notice dropped");
        }
    }

    async fn shutdown(mut self) {
        let flushed = self.engine.flush_all();
        if !flushed.is_empty() {
            info!(commands = flushed.len(), "flushing scheduled commits");
        }
        for command in flushed {
            self.dispatch(command);
        }
        while let Some((command, result)) = self.in_flight.next().await {
            self.complete(command, result);
        }
        self.publish_saving();
        self.feed_tx.send_replace(FeedStatus::Idle);
        info!("session stopped");
    }
}

async fn next_event(feed: &mut Option<BoxStream<'static, ChangeEvent>>) -> Option<ChangeEvent> {
    match feed {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
