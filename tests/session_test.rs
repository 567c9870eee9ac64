use anyhow::{anyhow, Result};
use chrono::Utc;
use daysync::engine::{CommitMode, EngineSettings, SyncEngine};
use daysync::model::{
    Change, ChangeEvent, Command, CommandPayload, Entry, EntryId, EntryStatus, OpKind, ScopeKey,
};
use daysync::remote::RemoteStore;
use daysync::session::{FeedStatus, Intent, Notice, Session, SessionSettings};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};

fn chicken() -> Entry {
    Entry {
        id: EntryId::new("e1"),
        name: "Chicken".into(),
        quantity: "100".into(),
        unit: "g".into(),
        value_snapshot: 165.0,
        per_unit_snapshot: Some(1.65),
        status: EntryStatus::Planned,
        ordering: Some(0),
        created_at: Utc::now(),
    }
}

/// Remote double: scripted submit results, a feed the test pushes into.
#[derive(Clone, Default)]
struct RecordingRemote {
    rows: Arc<Mutex<Vec<Entry>>>,
    responses: Arc<Mutex<VecDeque<Result<()>>>>,
    submitted: Arc<Mutex<Vec<Command>>>,
    feeds: Arc<Mutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>>,
    subscribe_calls: Arc<Mutex<usize>>,
    load_calls: Arc<Mutex<usize>>,
}

impl RecordingRemote {
    fn with_rows(rows: Vec<Entry>) -> Self {
        Self {
            rows: Arc::new(Mutex::new(rows)),
            ..Default::default()
        }
    }

    async fn respond_with(&self, responses: Vec<Result<()>>) {
        self.responses.lock().await.extend(responses);
    }

    async fn submitted(&self) -> Vec<Command> {
        self.submitted.lock().await.clone()
    }

    async fn push(&self, event: ChangeEvent) {
        for feed in self.feeds.lock().await.iter() {
            let _ = feed.send(event.clone());
        }
    }

    async fn drop_feeds(&self) {
        self.feeds.lock().await.clear();
    }

    async fn subscribe_calls(&self) -> usize {
        *self.subscribe_calls.lock().await
    }

    async fn load_calls(&self) -> usize {
        *self.load_calls.lock().await
    }
}

#[async_trait::async_trait]
impl RemoteStore for RecordingRemote {
    async fn load(&self, _scope: &ScopeKey) -> Result<Vec<Entry>> {
        *self.load_calls.lock().await += 1;
        Ok(self.rows.lock().await.clone())
    }

    async fn submit(&self, command: &Command) -> Result<()> {
        self.submitted.lock().await.push(command.clone());
        let mut guard = self.responses.lock().await;
        guard.pop_front().unwrap_or(Ok(()))
    }

    async fn subscribe(&self, _scope: &ScopeKey) -> Result<BoxStream<'static, ChangeEvent>> {
        *self.subscribe_calls.lock().await += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().await.push(tx);
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) }).boxed())
    }
}

fn settings() -> SessionSettings {
    SessionSettings {
        reconnect_base: Duration::from_millis(100),
        max_backoff: Duration::from_secs(2),
        stale_op_after: Duration::from_secs(30),
        channel_capacity: 16,
    }
}

fn engine() -> SyncEngine {
    SyncEngine::new(ScopeKey::new("day:2025-10-18"), EngineSettings::default())
}

fn e1() -> EntryId {
    EntryId::new("e1")
}

#[tokio::test(start_paused = true)]
async fn burst_reaches_remote_as_one_command() {
    let remote = RecordingRemote::with_rows(vec![chicken()]);
    let (handle, _notices, task) = Session::spawn(engine(), Arc::new(remote.clone()), settings());
    handle.watch_entries().wait_for(|rows| !rows.is_empty()).await.unwrap();
    assert_eq!(handle.feed_status(), FeedStatus::Live);

    for (i, qty) in ["110", "120", "130"].into_iter().enumerate() {
        if i > 0 {
            sleep(Duration::from_millis(100)).await;
        }
        handle
            .send(Intent::EditQuantity {
                id: e1(),
                quantity: qty.into(),
                mode: CommitMode::Debounced,
            })
            .await
            .unwrap();
    }
    sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.entries()[0].quantity, "130");
    assert_eq!(handle.entries()[0].value_snapshot, 214.5);

    sleep(Duration::from_millis(580)).await;
    assert!(remote.submitted().await.is_empty());

    sleep(Duration::from_millis(20)).await;
    let submitted = remote.submitted().await;
    assert_eq!(submitted.len(), 1);
    assert_eq!(
        submitted[0].payload,
        CommandPayload::UpdateQuantity {
            id: e1(),
            quantity: "130".into()
        }
    );

    drop(handle);
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn saving_label_lingers_after_fast_response() {
    let remote = RecordingRemote::with_rows(vec![chicken()]);
    let (handle, _notices, task) = Session::spawn(engine(), Arc::new(remote.clone()), settings());
    handle.watch_entries().wait_for(|rows| !rows.is_empty()).await.unwrap();

    handle
        .send(Intent::SetStatus {
            id: e1(),
            status: EntryStatus::Eaten,
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(remote.submitted().await.len(), 1);
    assert!(handle.is_saving(&e1()));
    // confirmed but the echo is outstanding
    assert_eq!(handle.pending().len(), 1);
    assert!(handle.pending()[0].confirmed_at.is_some());

    sleep(Duration::from_millis(300)).await;
    assert!(!handle.is_saving(&e1()));

    let op_id = remote.submitted().await[0].op_id;
    let mut echoed = chicken();
    echoed.status = EntryStatus::Eaten;
    remote
        .push(ChangeEvent::new(Change::Update { row: echoed }, Some(op_id)))
        .await;
    handle.watch_pending().wait_for(|ops| ops.is_empty()).await.unwrap();
    assert_eq!(handle.entries()[0].status, EntryStatus::Eaten);

    drop(handle);
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_command_rolls_back_and_notifies() {
    let remote = RecordingRemote::with_rows(vec![chicken()]);
    remote.respond_with(vec![Err(anyhow!("database is locked"))]).await;
    let (handle, mut notices, task) = Session::spawn(engine(), Arc::new(remote.clone()), settings());
    handle.watch_entries().wait_for(|rows| !rows.is_empty()).await.unwrap();

    handle
        .send(Intent::EditQuantity {
            id: e1(),
            quantity: "150".into(),
            mode: CommitMode::Immediate,
        })
        .await
        .unwrap();

    match notices.recv().await.unwrap() {
        Notice::CommandFailed(failure) => {
            assert_eq!(failure.kind, OpKind::UpdateQuantity);
            assert!(failure.rolled_back);
            assert!(failure.message.contains("database is locked"));
        }
        other => panic!("unexpected notice {other:?}"),
    }
    assert_eq!(handle.entries()[0].quantity, "100");
    assert_eq!(handle.entries()[0].value_snapshot, 165.0);
    assert!(handle.pending().is_empty());

    drop(handle);
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn invalid_intent_is_rejected_without_side_effects() {
    let remote = RecordingRemote::with_rows(vec![chicken()]);
    let (handle, mut notices, task) = Session::spawn(engine(), Arc::new(remote.clone()), settings());
    handle.watch_entries().wait_for(|rows| !rows.is_empty()).await.unwrap();

    handle
        .send(Intent::EditQuantity {
            id: e1(),
            quantity: "abc".into(),
            mode: CommitMode::Immediate,
        })
        .await
        .unwrap();
    handle.send(Intent::DragEnd { from: 0, to: 5 }).await.unwrap();

    assert!(matches!(
        notices.recv().await.unwrap(),
        Notice::Rejected { intent: "edit_quantity", .. }
    ));
    assert!(matches!(
        notices.recv().await.unwrap(),
        Notice::Rejected { intent: "drag_end", .. }
    ));
    assert!(remote.submitted().await.is_empty());
    assert_eq!(handle.entries().len(), 1);
    assert_eq!(handle.entries()[0].quantity, "100");
    assert!(handle.pending().is_empty());

    drop(handle);
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn feed_drop_reconnects_and_reloads() {
    let remote = RecordingRemote::with_rows(vec![chicken()]);
    let (handle, _notices, task) = Session::spawn(engine(), Arc::new(remote.clone()), settings());
    handle.watch_entries().wait_for(|rows| !rows.is_empty()).await.unwrap();
    assert_eq!(remote.subscribe_calls().await, 1);
    assert_eq!(remote.load_calls().await, 1);

    // a change lands while the feed is down
    remote.drop_feeds().await;
    let mut other = chicken();
    other.id = EntryId::new("e2");
    other.name = "Rice".into();
    other.ordering = Some(1);
    remote.rows.lock().await.push(other);

    handle
        .watch_feed_status()
        .wait_for(|s| *s == FeedStatus::Error)
        .await
        .unwrap();
    handle.watch_entries().wait_for(|rows| rows.len() == 2).await.unwrap();
    assert_eq!(handle.feed_status(), FeedStatus::Live);
    assert_eq!(remote.subscribe_calls().await, 2);
    assert_eq!(remote.load_calls().await, 2);

    drop(handle);
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_scheduled_edits() {
    let remote = RecordingRemote::with_rows(vec![chicken()]);
    let (handle, _notices, task) = Session::spawn(engine(), Arc::new(remote.clone()), settings());
    handle.watch_entries().wait_for(|rows| !rows.is_empty()).await.unwrap();

    handle
        .send(Intent::EditQuantity {
            id: e1(),
            quantity: "175".into(),
            mode: CommitMode::Debounced,
        })
        .await
        .unwrap();
    drop(handle);
    task.await.unwrap().unwrap();

    let submitted = remote.submitted().await;
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].kind(), OpKind::UpdateQuantity);
}
