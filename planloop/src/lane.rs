//! Execution lanes for one phase of a round.
//!
//! A phase runs in the automated lane (agent subprocess, one repair attempt)
//! or the manual lane (file handoff). In `hybrid` mode an automated failure
//! permanently moves the run to the manual lane; in `auto` mode it is fatal.

use std::path::Path;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::extract::extract;
use crate::core::types::{Lane, Mode, Phase};
use crate::io::agent::{Agent, AgentReply, AgentRequest};
use crate::io::assets::PhaseSchema;
use crate::io::cancel::CancelToken;
use crate::io::layout::PhasePaths;
use crate::io::manual::{wait_for_submission, write_handoff};
use crate::io::prompt::repair_prompt;
use crate::io::round_log::{write_json, write_text};
use crate::io::run_state::{RunState, StateStore};
use crate::round::LoopEvent;

/// Limits applied to each phase.
#[derive(Debug, Clone, Copy)]
pub struct LaneSettings {
    pub agent_timeout: Duration,
    pub agent_output_limit_bytes: usize,
    pub poll_interval: Duration,
}

/// One phase to execute.
#[derive(Debug, Clone, Copy)]
pub struct PhaseRequest<'a> {
    pub round: u32,
    pub phase: Phase,
    pub prompt: &'a str,
    pub schema: &'a PhaseSchema,
    pub paths: &'a PhasePaths,
    /// Working directory for the agent (the plan's directory).
    pub workdir: &'a Path,
}

/// A validated phase result and where it came from.
#[derive(Debug, Clone)]
pub struct PhaseOutput<T> {
    pub result: T,
    pub raw: String,
    /// `auto-<mode>`, `auto-repair-<mode>` or `manual-<mode>`.
    pub provenance: String,
}

/// Executes phases for a run, switching lanes as the run's mode allows.
pub struct PhaseRunner<'a> {
    pub agent: &'a dyn Agent,
    pub store: &'a StateStore,
    pub cancel: &'a CancelToken,
    pub settings: LaneSettings,
    pub on_event: &'a dyn Fn(&LoopEvent),
}

/// Outcome of a single extraction + typed decode.
struct Accepted<T> {
    result: T,
    value: Value,
    mode: &'static str,
}

struct Rejected {
    mode: &'static str,
    errors: Vec<String>,
}

impl PhaseRunner<'_> {
    /// Run `request.phase` and return a schema-valid, typed result.
    ///
    /// Always writes `<phase>_prompt.md`, `<phase>_raw_output.txt` and, on
    /// success, `<phase>_result.json`. May persist `state` when failing over.
    #[instrument(skip_all, fields(round = request.round, phase = request.phase.as_str()))]
    pub fn run_phase<T: DeserializeOwned>(
        &self,
        state: &mut RunState,
        request: &PhaseRequest<'_>,
    ) -> Result<PhaseOutput<T>> {
        let paths = request.paths;
        write_text(&paths.prompt_path, request.prompt)?;
        self.cancel.check()?;

        let lane = if state.mode == Mode::Manual {
            Lane::Manual
        } else {
            state.current_lane
        };

        if lane == Lane::Auto {
            match self.automated::<T>(request)? {
                Ok(output) => return Ok(output),
                Err(reason) => {
                    // An interrupt kills the child; report it as such, not as a lane failure.
                    self.cancel.check()?;
                    if !state.mode.allows_failover() {
                        return Err(anyhow!(reason));
                    }
                    warn!(reason = %reason, "automated lane failed, switching to manual");
                    state.current_lane = Lane::Manual;
                    self.store.save(state)?;
                    (self.on_event)(&LoopEvent::Fallback {
                        phase: request.phase,
                        reason,
                    });
                }
            }
        }

        self.manual::<T>(request)
    }

    /// `Ok(Err(reason))` is a lane failure eligible for failover.
    fn automated<T: DeserializeOwned>(
        &self,
        request: &PhaseRequest<'_>,
    ) -> Result<Result<PhaseOutput<T>, String>> {
        let phase = request.phase.as_str();
        let paths = request.paths;
        info!("running automated lane");

        let reply = match self.invoke(request, request.prompt) {
            Ok(reply) => reply,
            Err(message) => {
                write_text(&paths.raw_output_path, &message)?;
                return Ok(Err(format!("{phase} agent failed to launch: {message}")));
            }
        };
        write_text(&paths.raw_output_path, &reply.combined())?;
        if !reply.succeeded() {
            return Ok(Err(format!("{phase} agent {}", failure_detail(&reply))));
        }

        let first = match accept::<T>(&reply.stdout, request.schema) {
            Ok(accepted) => {
                write_json(&paths.result_path, &accepted.value)?;
                return Ok(Ok(PhaseOutput {
                    result: accepted.result,
                    raw: reply.combined(),
                    provenance: format!("auto-{}", accepted.mode),
                }));
            }
            Err(rejected) => rejected,
        };
        warn!(mode = first.mode, errors = %first.errors.join("; "), "extraction failed, attempting repair");

        let prompt = repair_prompt(&request.schema.pretty(), &reply.stdout);
        write_text(&paths.repair_prompt_path, &prompt)?;
        let repair = match self.invoke(request, &prompt) {
            Ok(repair) => repair,
            Err(message) => {
                write_text(&paths.repair_raw_output_path, &message)?;
                return Ok(Err(parse_failure(
                    phase,
                    &first.errors,
                    &[format!("repair agent failed to launch: {message}")],
                )));
            }
        };
        write_text(&paths.repair_raw_output_path, &repair.combined())?;
        if !repair.succeeded() {
            return Ok(Err(parse_failure(
                phase,
                &first.errors,
                &[format!("repair agent {}", failure_detail(&repair))],
            )));
        }

        match accept::<T>(&repair.stdout, request.schema) {
            Ok(accepted) => {
                info!(mode = accepted.mode, "repair succeeded");
                write_json(&paths.result_path, &accepted.value)?;
                Ok(Ok(PhaseOutput {
                    result: accepted.result,
                    raw: repair.combined(),
                    provenance: format!("auto-repair-{}", accepted.mode),
                }))
            }
            Err(rejected) => Ok(Err(parse_failure(phase, &first.errors, &rejected.errors))),
        }
    }

    fn manual<T: DeserializeOwned>(&self, request: &PhaseRequest<'_>) -> Result<PhaseOutput<T>> {
        let paths = request.paths;
        let command = self.agent.describe(&request.schema.path);
        write_handoff(paths, request.phase, request.prompt, &command)?;

        let phase = request.phase;
        let (accepted, raw) = wait_for_submission(
            paths,
            phase,
            self.settings.poll_interval,
            self.cancel,
            |raw| accept::<T>(raw, request.schema).map_err(|rejected| rejected.errors),
            |notice| (self.on_event)(&LoopEvent::Manual { phase, notice }),
        )?;

        write_text(&paths.raw_output_path, &raw)?;
        write_json(&paths.result_path, &accepted.value)?;
        Ok(PhaseOutput {
            result: accepted.result,
            raw,
            provenance: format!("manual-{}", accepted.mode),
        })
    }

    /// Launch failures come back as `Err(message)`.
    fn invoke(&self, request: &PhaseRequest<'_>, prompt: &str) -> Result<AgentReply, String> {
        let agent_request = AgentRequest {
            workdir: request.workdir.to_path_buf(),
            prompt: prompt.to_string(),
            schema_path: request.schema.path.clone(),
            timeout: self.settings.agent_timeout,
            output_limit_bytes: self.settings.agent_output_limit_bytes,
            interrupt: Some(self.cancel.interrupt_flag()),
        };
        self.agent.invoke(&agent_request).map_err(|err| {
            warn!(err = %err, "agent launch failed");
            format!("{err:#}")
        })
    }
}

/// Extract, validate and decode `raw` into `T`.
fn accept<T: DeserializeOwned>(raw: &str, schema: &PhaseSchema) -> Result<Accepted<T>, Rejected> {
    let extraction = extract(raw, &schema.compiled);
    let mode = extraction.mode_tag();
    let Some(object) = extraction.value else {
        return Err(Rejected {
            mode,
            errors: extraction.errors,
        });
    };
    let value = Value::Object(object);
    match serde_json::from_value::<T>(value.clone()) {
        Ok(result) => Ok(Accepted {
            result,
            value,
            mode,
        }),
        Err(err) => Err(Rejected {
            mode,
            errors: vec![format!("$: {err}")],
        }),
    }
}

fn failure_detail(reply: &AgentReply) -> String {
    if reply.timed_out {
        return "timed out".to_string();
    }
    match reply.exit_code {
        Some(code) => format!("failed with exit code {code}"),
        None => "was terminated by a signal".to_string(),
    }
}

fn parse_failure(phase: &str, first: &[String], repair: &[String]) -> String {
    let errors: Vec<&str> = first.iter().chain(repair).map(String::as_str).collect();
    format!("{phase} parse failed: {}", errors.join("; "))
}
