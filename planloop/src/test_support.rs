//! Test-only helpers: a scripted agent and a throwaway plan workspace.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::json;

use crate::core::objective::ObjectiveSnapshot;
use crate::core::types::Mode;
use crate::io::agent::{Agent, AgentReply, AgentRequest};
use crate::io::assets::Assets;
use crate::io::cancel::CancelToken;
use crate::io::config::LoopConfig;
use crate::io::layout::RunLayout;
use crate::io::run_state::{RunState, StateStore};
use crate::round::{LoopContext, LoopEvent, LoopOutcome, drive, start_run};

/// One scripted agent response.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Reply(AgentReply),
    /// The agent could not be started.
    LaunchError(String),
}

impl ScriptedReply {
    /// Exit 0 with `stdout`.
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self::Reply(AgentReply {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            timed_out: false,
        })
    }

    pub fn exit(code: i32, stderr: impl Into<String>) -> Self {
        Self::Reply(AgentReply {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
            timed_out: false,
        })
    }

    pub fn launch_error(message: impl Into<String>) -> Self {
        Self::LaunchError(message.into())
    }
}

/// Agent that replays scripted replies in order and records every request.
///
/// Once the script is exhausted every invocation fails to launch.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    replies: RefCell<VecDeque<ScriptedReply>>,
    requests: RefCell<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.borrow().clone()
    }
}

impl Agent for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentReply> {
        self.requests.borrow_mut().push(request.clone());
        match self.replies.borrow_mut().pop_front() {
            Some(ScriptedReply::Reply(reply)) => Ok(reply),
            Some(ScriptedReply::LaunchError(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted agent has no replies left")),
        }
    }
}

/// Judge result JSON conforming to the shipped schema.
pub fn judge_json(pass: bool, problems: &[&str]) -> String {
    json!({
        "pass": pass,
        "problems": problems,
        "blocking": !problems.is_empty(),
        "summary": if problems.is_empty() { "looks complete".to_string() } else { format!("{} problem(s)", problems.len()) },
        "rewrite_instructions": problems.iter().map(|p| format!("fix: {p}")).collect::<Vec<_>>(),
    })
    .to_string()
}

/// Judge result JSON carrying only the required `pass` and `problems`.
pub fn minimal_judge_json(pass: bool, problems: &[&str]) -> String {
    json!({ "pass": pass, "problems": problems }).to_string()
}

/// Rewrite result JSON conforming to the shipped schema.
pub fn rewrite_json(plan: &str, fixes: &[&str]) -> String {
    json!({
        "revised_plan_markdown": plan,
        "applied_fixes": fixes,
        "summary": "rewrote plan",
    })
    .to_string()
}

/// A temporary directory holding one plan file and its loop layout.
pub struct PlanWorkspace {
    _temp: tempfile::TempDir,
    pub plan_path: PathBuf,
    pub layout: RunLayout,
    pub store: StateStore,
    pub assets: Assets,
    pub config: LoopConfig,
    pub interrupted: Arc<AtomicBool>,
}

impl PlanWorkspace {
    /// Workspace with `plan.md` containing `plan` and a fast manual poll.
    pub fn new(plan: &str) -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let plan_path = temp.path().join("plan.md");
        fs::write(&plan_path, plan)?;
        let layout = RunLayout::for_plan(&plan_path)?;
        let store = StateStore::new(&layout.state_path);
        let assets = Assets::builtin(&layout.assets_dir)?;
        Ok(Self {
            _temp: temp,
            plan_path,
            layout,
            store,
            assets,
            config: LoopConfig {
                manual_poll_interval_ms: 10,
                agent_timeout_secs: 5,
                ..LoopConfig::default()
            },
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken::new(self.store.clone(), Arc::clone(&self.interrupted))
    }

    pub fn start(&self, mode: Mode, max_rounds: Option<u32>) -> Result<(RunState, ObjectiveSnapshot)> {
        start_run(&self.layout, &self.store, mode, max_rounds)
    }

    /// Drive `state` to a terminal status, collecting every event.
    pub fn drive(
        &self,
        agent: &dyn Agent,
        state: &mut RunState,
        snapshot: &ObjectiveSnapshot,
    ) -> Result<(LoopOutcome, Vec<LoopEvent>)> {
        let events = RefCell::new(Vec::new());
        let on_event = |event: &LoopEvent| events.borrow_mut().push(event.clone());
        let cancel = self.cancel_token();
        let ctx = LoopContext {
            layout: &self.layout,
            assets: &self.assets,
            config: &self.config,
            agent,
            store: &self.store,
            cancel: &cancel,
            on_event: &on_event,
        };
        let outcome = drive(&ctx, state, snapshot, false)?;
        Ok((outcome, events.into_inner()))
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval()
    }
}
