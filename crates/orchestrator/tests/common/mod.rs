//! Shared fixtures for the pipeline tests: a scripted tool runner, an
//! in-memory bus and artifact store, SQLite state, and a builder wired
//! to all of them.

use events::{EventBus, ProgressEvent, Subscription};
use orchestrator::builder::Builder;
use orchestrator::config::Config;
use orchestrator::tool::{ToolError, ToolOutput, ToolRequest, ToolRunner};
use state::Database;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use storage::ArtifactStore;
use tempfile::TempDir;

/// One scripted tool invocation outcome, optionally dropping files into
/// the workspace the way a real tool would.
pub struct ScriptedOutcome {
    result: ScriptedResult,
    creates: Vec<(String, String)>,
}

enum ScriptedResult {
    Output(ToolOutput),
    TimedOut,
    Panic,
}

impl ScriptedOutcome {
    pub fn ok(stdout: &str) -> Self {
        Self {
            result: ScriptedResult::Output(ToolOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: 0,
            }),
            creates: Vec::new(),
        }
    }

    pub fn fail(stdout: &str, stderr: &str, exit_code: i32) -> Self {
        Self {
            result: ScriptedResult::Output(ToolOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code,
            }),
            creates: Vec::new(),
        }
    }

    pub fn timed_out() -> Self {
        Self {
            result: ScriptedResult::TimedOut,
            creates: Vec::new(),
        }
    }

    pub fn panics() -> Self {
        Self {
            result: ScriptedResult::Panic,
            creates: Vec::new(),
        }
    }

    /// Also write a file (relative to the invocation cwd) when this
    /// outcome plays.
    pub fn creating(mut self, relative_path: &str, content: &str) -> Self {
        self.creates.push((relative_path.to_string(), content.to_string()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Plays scripted outcomes keyed by tool ("claude", "vercel build",
/// "vercel deploy", "vercel link", "app-manager"); anything unscripted
/// succeeds with empty output. Records every invocation.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn script(&self, key: &str, outcome: ScriptedOutcome) {
        self.scripts
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn count(&self, key: &str) -> usize {
        self.invocations()
            .iter()
            .filter(|invocation| invocation_key(invocation) == key)
            .count()
    }

    /// Agent invocations carrying the continue flag, i.e. repair passes.
    pub fn repair_invocations(&self) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|invocation| {
                invocation_key(invocation) == "claude"
                    && invocation.args.first().map(String::as_str) == Some("-c")
            })
            .collect()
    }

    /// The prompt argument of the n-th agent invocation.
    pub fn agent_prompt(&self, index: usize) -> String {
        let agents: Vec<Invocation> = self
            .invocations()
            .into_iter()
            .filter(|invocation| invocation_key(invocation) == "claude")
            .collect();
        agents[index].args.last().cloned().unwrap_or_default()
    }
}

fn invocation_key(invocation: &Invocation) -> String {
    let program = Path::new(&invocation.program)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| invocation.program.clone());
    if program == "vercel" {
        format!(
            "vercel {}",
            invocation.args.first().cloned().unwrap_or_default()
        )
    } else {
        program
    }
}

#[async_trait::async_trait]
impl ToolRunner for ScriptedRunner {
    async fn run(&self, request: ToolRequest) -> Result<ToolOutput, ToolError> {
        let invocation = Invocation {
            program: request.program.clone(),
            args: request.args.clone(),
            cwd: request.cwd.clone(),
        };
        let key = invocation_key(&invocation);
        self.invocations.lock().unwrap().push(invocation);

        let outcome = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());

        let Some(outcome) = outcome else {
            return Ok(ToolOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            });
        };

        for (relative, content) in &outcome.creates {
            let target = request.cwd.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(target, content).unwrap();
        }

        match outcome.result {
            ScriptedResult::Output(output) => Ok(output),
            ScriptedResult::TimedOut => Err(ToolError::TimedOut {
                program: request.program,
                timeout: request.timeout,
            }),
            ScriptedResult::Panic => panic!("scripted tool panic"),
        }
    }
}

pub struct Harness {
    pub config: Arc<Config>,
    pub db: Arc<Database>,
    pub artifacts: Arc<ArtifactStore>,
    pub bus: Arc<EventBus>,
    pub runner: Arc<ScriptedRunner>,
    pub builder: Arc<Builder>,
    // Held for their Drop cleanup.
    _workspace_base: TempDir,
    _starter: TempDir,
}

pub async fn harness() -> Harness {
    let workspace_base = TempDir::new().unwrap();
    let starter = TempDir::new().unwrap();

    // A minimal starter tree, including byproducts that must never be
    // mirrored or packaged.
    fs::create_dir_all(starter.path().join("src")).unwrap();
    fs::write(
        starter.path().join("src/App.jsx"),
        "export default function App() {}\n",
    )
    .unwrap();
    fs::write(starter.path().join("package.json"), "{\"name\":\"starter\"}\n").unwrap();
    fs::write(starter.path().join("STARTER_ONLY.txt"), "starter marker\n").unwrap();
    fs::create_dir_all(starter.path().join("node_modules/react")).unwrap();
    fs::write(starter.path().join("node_modules/react/index.js"), "x").unwrap();

    let config = Arc::new(Config {
        port: 0,
        database_url: None,
        s3_bucket: None,
        nats_url: None,
        jwt_secret: "test-secret".to_string(),
        vercel_token: None,
        workspace_dir: workspace_base.path().to_path_buf(),
        starter_code_dir: starter.path().to_path_buf(),
        agent_binary_path: Some("claude".to_string()),
        agent_timeout: Duration::from_secs(60),
        prebuild_timeout: Duration::from_secs(60),
        deploy_timeout: Duration::from_secs(60),
        link_timeout: Duration::from_secs(60),
        schema_bootstrap_timeout: Duration::from_secs(60),
        max_build_attempts: 3,
        // Tests must not depend on the subscription grace sleep.
        subscribe_grace: Duration::from_secs(0),
        sse_heartbeat_interval: Duration::from_secs(15),
        sse_max_duration: Duration::from_secs(60),
    });

    let db = Arc::new(Database::new_in_memory().await.unwrap());
    let artifacts = Arc::new(ArtifactStore::in_memory());
    let bus = Arc::new(EventBus::in_memory());
    let runner = Arc::new(ScriptedRunner::default());

    let builder = Arc::new(Builder::new(
        config.clone(),
        db.clone(),
        artifacts.clone(),
        bus.clone(),
        runner.clone(),
    ));

    Harness {
        config,
        db,
        artifacts,
        bus,
        runner,
        builder,
        _workspace_base: workspace_base,
        _starter: starter,
    }
}

/// Drain a subscription until the terminal event (or a per-message
/// timeout), returning everything received.
pub async fn collect_progress(mut subscription: Subscription) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    loop {
        let message =
            match tokio::time::timeout(Duration::from_secs(5), subscription.next()).await {
                Ok(Some(payload)) => payload,
                _ => break,
            };
        if let Ok(event) = serde_json::from_slice::<ProgressEvent>(&message) {
            let terminal = event.status.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
    }
    events
}
