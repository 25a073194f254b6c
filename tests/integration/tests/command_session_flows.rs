use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use issuebot_session::{
    AllowList, CommandContext, CommandOutcome, CommandSessionConfig, CommandSource, CreatedIssue,
    Credential, CredentialRegistry, CredentialSecret, GateState, InboundCommand, IssueRequest,
    IssueTracker, JsonFileCredentialStorage, ReplySink, SessionLifecycle, SessionLifecycleConfig,
    TrackerError, TrackerIdentity, UserId,
};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

static WORKSPACE_COUNTER: AtomicU64 = AtomicU64::new(1);

struct IsolatedWorkspace {
    root: PathBuf,
}

impl IsolatedWorkspace {
    fn new(label: &str) -> Self {
        let tick = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let count = WORKSPACE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "issuebot-{label}-{}-{tick}-{count}",
            std::process::id()
        ));
        fs::create_dir_all(&root).expect("must create isolated workspace root");
        Self { root }
    }

    fn store_path(&self) -> PathBuf {
        self.root.join("usertokens.json")
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

struct ScriptedTracker {
    identities: HashMap<String, TrackerIdentity>,
    requests: AsyncMutex<Vec<(String, IssueRequest)>>,
    hold: Option<Arc<Notify>>,
    issue_counter: AtomicU64,
}

impl ScriptedTracker {
    fn new(identities: &[(&str, &str)]) -> Self {
        Self {
            identities: identities
                .iter()
                .map(|(token, login)| {
                    (
                        token.to_string(),
                        TrackerIdentity {
                            login: login.to_string(),
                            name: None,
                        },
                    )
                })
                .collect(),
            requests: AsyncMutex::new(Vec::new()),
            hold: None,
            issue_counter: AtomicU64::new(1),
        }
    }

    fn holding(mut self, hold: Arc<Notify>) -> Self {
        self.hold = Some(hold);
        self
    }

    async fn requests(&self) -> Vec<(String, IssueRequest)> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl IssueTracker for ScriptedTracker {
    async fn create_issue(
        &self,
        _ctx: &CommandContext,
        credential: &Credential,
        request: &IssueRequest,
    ) -> Result<CreatedIssue, TrackerError> {
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }
        self.requests
            .lock()
            .await
            .push((credential.secret().expose().to_string(), request.clone()));
        let number = self.issue_counter.fetch_add(1, Ordering::Relaxed);
        Ok(CreatedIssue {
            url: format!(
                "https://github.com/{}/{}/issues/{number}",
                request.owner, request.repo
            ),
        })
    }

    async fn verify_credential(
        &self,
        _ctx: &CommandContext,
        secret: &CredentialSecret,
    ) -> Result<TrackerIdentity, TrackerError> {
        self.identities
            .get(secret.expose())
            .cloned()
            .ok_or(TrackerError::Unauthorized)
    }
}

#[derive(Default)]
struct TranscriptSink {
    lines: Mutex<Vec<String>>,
}

impl TranscriptSink {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("transcript lock").clone()
    }

    async fn wait_for_lines(&self, count: usize) -> Vec<String> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let lines = self.lines();
                if lines.len() >= count {
                    return lines;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("replies should arrive")
    }
}

#[async_trait]
impl ReplySink for TranscriptSink {
    async fn reply(&self, text: &str) -> anyhow::Result<()> {
        self.lines
            .lock()
            .expect("transcript lock")
            .push(text.to_string());
        Ok(())
    }

    async fn report_error(&self, text: &str) -> anyhow::Result<()> {
        self.lines
            .lock()
            .expect("transcript lock")
            .push(format!("error: {text}"));
        Ok(())
    }
}

struct ChannelSource {
    rx: mpsc::UnboundedReceiver<InboundCommand>,
    disconnected: bool,
}

#[async_trait]
impl CommandSource for ChannelSource {
    async fn next_command(&mut self) -> anyhow::Result<Option<InboundCommand>> {
        Ok(self.rx.recv().await)
    }

    async fn disconnect(&mut self) -> anyhow::Result<()> {
        self.disconnected = true;
        Ok(())
    }
}

fn command(user: &str, text: &str, sink: &Arc<TranscriptSink>) -> InboundCommand {
    InboundCommand {
        user_id: UserId::new(user),
        text: text.to_string(),
        reply: Arc::clone(sink) as Arc<dyn ReplySink>,
    }
}

fn start_lifecycle(
    store_path: &Path,
    tracker: Arc<ScriptedTracker>,
    allowed: &[&str],
    drain_timeout: Duration,
) -> SessionLifecycle {
    let allow_list = AllowList::new(allowed.iter().map(|user| UserId::new(*user)).collect());
    SessionLifecycle::start(
        Arc::new(JsonFileCredentialStorage::new(store_path)),
        tracker,
        Arc::new(allow_list),
        CommandSessionConfig::new("acme"),
        SessionLifecycleConfig {
            drain_timeout,
            cancel_grace: Duration::from_millis(200),
        },
    )
    .expect("lifecycle should start")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integration_register_then_file_issue_persists_across_restart() {
    let workspace = IsolatedWorkspace::new("register-file");
    let tracker = Arc::new(ScriptedTracker::new(&[("ghp_alice", "alice")]));
    let lifecycle = start_lifecycle(
        &workspace.store_path(),
        Arc::clone(&tracker),
        &[],
        Duration::from_secs(5),
    );
    let sink = Arc::new(TranscriptSink::default());
    let (tx, rx) = mpsc::unbounded_channel();
    let mut source = ChannelSource {
        rx,
        disconnected: false,
    };

    let driver = async {
        tx.send(command("U1", "register ghp_alice", &sink))
            .expect("send register");
        sink.wait_for_lines(1).await;
        tx.send(command(
            "U1",
            "new \"widgets\" \"Crash on start\" \"Steps: run it\"",
            &sink,
        ))
        .expect("send new");
        tx.send(command("U1", "new \"widgets\"", &sink))
            .expect("send bad new");
        sink.wait_for_lines(3).await;
        drop(tx);
    };
    let (report, ()) = tokio::join!(lifecycle.run(&mut source, std::future::pending()), driver);

    assert!(report.drained);
    assert!(!report.cancelled);
    assert!(report.flushed);
    assert!(source.disconnected);

    let lines = sink.lines();
    assert_eq!(lines[0], "User successfully registered: alice, alice");
    assert!(lines
        .contains(&"Issue created: https://github.com/acme/widgets/issues/1".to_string()));
    assert!(lines
        .contains(&"error: Usage: new \"repo\" \"issue title\" \"issue body\"".to_string()));

    let requests = tracker.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "ghp_alice");
    assert_eq!(requests[0].1.owner, "acme");
    assert_eq!(requests[0].1.title, "Crash on start");
    assert_eq!(requests[0].1.body, "Steps: run it");

    let reloaded = CredentialRegistry::load(Arc::new(JsonFileCredentialStorage::new(
        workspace.store_path(),
    )))
    .expect("store should reload");
    assert!(reloaded.contains(&UserId::new("U1")));
    assert!(!reloaded.is_dirty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integration_drain_finishes_in_flight_issue_and_rejects_new_work() {
    let workspace = IsolatedWorkspace::new("drain");
    fs::write(
        workspace.store_path(),
        r#"{"schema_version": 1, "users": {"U1": "ghp_alice"}}"#,
    )
    .expect("seed store");
    let hold = Arc::new(Notify::new());
    let tracker = Arc::new(ScriptedTracker::new(&[]).holding(Arc::clone(&hold)));
    let lifecycle = start_lifecycle(
        &workspace.store_path(),
        Arc::clone(&tracker),
        &[],
        Duration::from_secs(5),
    );
    let first_sink = Arc::new(TranscriptSink::default());
    let late_sink = Arc::new(TranscriptSink::default());

    let in_flight = lifecycle.dispatch(command(
        "U1",
        "new \"acme/widgets\" \"Slow\" \"held by the tracker\"",
        &first_sink,
    ));
    tokio::time::timeout(Duration::from_secs(5), async {
        while lifecycle.gate().in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("command should be admitted");

    let late = async {
        while lifecycle.gate().state() == GateState::Open {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let outcome = lifecycle
            .dispatch(command("U1", "unregister", &late_sink))
            .await
            .expect("late command task");
        hold.notify_one();
        outcome
    };
    let (report, late_outcome) = tokio::join!(lifecycle.shutdown(), late);

    assert_eq!(late_outcome, CommandOutcome::RejectedShuttingDown);
    assert_eq!(
        late_sink.lines(),
        vec!["error: I'm shutting down, please retry shortly.".to_string()]
    );
    assert!(report.drained);
    assert!(!report.cancelled);
    assert_eq!(lifecycle.gate().state(), GateState::Closed);

    let outcome = in_flight.await.expect("in-flight command task");
    assert_eq!(
        outcome,
        CommandOutcome::IssueCreated {
            url: "https://github.com/acme/widgets/issues/1".to_string()
        }
    );
    // The rejected unregister never touched the registry.
    assert!(lifecycle
        .session()
        .registry()
        .contains(&UserId::new("U1")));
}

#[tokio::test]
async fn integration_legacy_store_is_rewritten_on_shutdown() {
    let workspace = IsolatedWorkspace::new("legacy");
    fs::write(workspace.store_path(), r#"{"U1": "ghp_alice"}"#).expect("seed legacy store");
    let lifecycle = start_lifecycle(
        &workspace.store_path(),
        Arc::new(ScriptedTracker::new(&[])),
        &[],
        Duration::from_secs(1),
    );
    assert!(lifecycle.session().registry().is_dirty());

    let report = lifecycle.shutdown().await;
    assert!(report.flushed);

    let raw = fs::read_to_string(workspace.store_path()).expect("read store");
    let document: Value = serde_json::from_str(&raw).expect("store json");
    assert_eq!(document["schema_version"], 1);
    assert_eq!(document["users"]["U1"], "ghp_alice");
}

#[tokio::test]
async fn regression_allow_list_blocks_unlisted_users_but_not_help() {
    let workspace = IsolatedWorkspace::new("allow-list");
    let lifecycle = start_lifecycle(
        &workspace.store_path(),
        Arc::new(ScriptedTracker::new(&[("ghp_bob", "bob")])),
        &["U1"],
        Duration::from_secs(1),
    );
    let sink = Arc::new(TranscriptSink::default());

    let blocked = lifecycle
        .dispatch(command("U2", "register ghp_bob", &sink))
        .await
        .expect("register task");
    assert_eq!(blocked, CommandOutcome::NotAuthorized);
    let help = lifecycle
        .dispatch(command("U2", "help", &sink))
        .await
        .expect("help task");
    assert_eq!(help, CommandOutcome::HelpShown);

    let lines = sink.lines();
    assert_eq!(lines[0], "error: You are not authorized to use this bot.");
    assert!(lines[1].starts_with("Available commands:"));
    assert!(lifecycle.session().registry().is_empty());

    lifecycle
        .session()
        .allow_list()
        .replace(HashSet::from([UserId::new("U1"), UserId::new("U2")]));
    let admitted = lifecycle
        .dispatch(command("U2", "register ghp_bob", &sink))
        .await
        .expect("register task");
    assert_eq!(
        admitted,
        CommandOutcome::Registered {
            login: "bob".to_string()
        }
    );
}

#[tokio::test]
async fn regression_corrupt_store_refuses_to_start() {
    let workspace = IsolatedWorkspace::new("corrupt");
    fs::write(workspace.store_path(), r#"{"schema_version": 1, "users": {"#)
        .expect("seed truncated store");
    let result = SessionLifecycle::start(
        Arc::new(JsonFileCredentialStorage::new(workspace.store_path())),
        Arc::new(ScriptedTracker::new(&[])),
        Arc::new(AllowList::default()),
        CommandSessionConfig::new("acme"),
        SessionLifecycleConfig::default(),
    );
    match result {
        Err(error) => assert!(error.is_corruption(), "{error}"),
        Ok(_) => panic!("truncated store must not load"),
    }
}
