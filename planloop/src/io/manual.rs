//! Manual lane: file handoff to a human operator.
//!
//! The prompt and a short instruction file are written into the round
//! directory; the operator runs the agent by hand and saves its output to
//! `manual_<phase>_output.txt`. The loop polls that file until it holds an
//! acceptable result or the run is cancelled.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use super::cancel::CancelToken;
use super::layout::PhasePaths;
use super::round_log::write_text;
use crate::core::types::Phase;

/// Polls between "still waiting" notices.
pub const STILL_WAITING_EVERY: u64 = 10;

/// Progress reported while waiting for a manual submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualNotice {
    /// Handoff files are in place; waiting for `output`.
    Waiting { output: String },
    /// A submission was read but rejected; the operator should overwrite it.
    Rejected { errors: Vec<String> },
    StillWaiting,
}

/// Write `manual_<phase>_prompt.md` and `manual_<phase>_instructions.txt`.
///
/// `command` is the agent command line (without redirections) the operator
/// should run.
pub fn write_handoff(paths: &PhasePaths, phase: Phase, prompt: &str, command: &str) -> Result<()> {
    write_text(&paths.manual_prompt_path, prompt)?;
    let instructions = format!(
        "Manual handoff required for phase: {phase}\n\n\
         In another terminal, run:\n\
         {command} < \"{prompt}\" > \"{output}\"\n\n\
         Save the full command output to:\n{output}\n\n\
         The loop continues automatically once the file appears and parses.\n\
         If it is rejected, overwrite the same file with corrected content.\n",
        phase = phase.as_str(),
        prompt = paths.manual_prompt_path.display(),
        output = paths.manual_output_path.display(),
    );
    write_text(&paths.manual_instructions_path, &instructions)?;
    debug!(path = %paths.manual_instructions_path.display(), "wrote manual handoff");
    Ok(())
}

/// Poll `paths.manual_output_path` until `accept` takes a submission.
///
/// A submission is considered when the file exists, is non-empty, and its
/// modification time differs from the last one examined. Cancellation is
/// checked on every tick. Returns the accepted value and the raw text.
#[instrument(skip_all, fields(phase = phase.as_str()))]
pub fn wait_for_submission<R, A, N>(
    paths: &PhasePaths,
    phase: Phase,
    poll_interval: Duration,
    cancel: &CancelToken,
    mut accept: A,
    mut notify: N,
) -> Result<(R, String)>
where
    A: FnMut(&str) -> Result<R, Vec<String>>,
    N: FnMut(ManualNotice),
{
    let output_path = &paths.manual_output_path;
    info!(output = %output_path.display(), "waiting for manual submission");
    notify(ManualNotice::Waiting {
        output: output_path.display().to_string(),
    });

    let mut last_seen: Option<SystemTime> = None;
    let mut tick: u64 = 0;
    loop {
        cancel
            .check()
            .with_context(|| format!("manual {} wait", phase.as_str()))?;

        if let Some(modified) = fresh_submission(output_path, last_seen)? {
            last_seen = Some(modified);
            match fs::read(output_path) {
                Ok(bytes) => {
                    let raw = decode_submission(&bytes);
                    match accept(&raw) {
                        Ok(value) => {
                            info!("manual submission accepted");
                            return Ok((value, raw));
                        }
                        Err(errors) => {
                            warn!(errors = %errors.join("; "), "manual submission rejected");
                            notify(ManualNotice::Rejected { errors });
                        }
                    }
                }
                Err(err) => {
                    warn!(err = %err, "manual submission unreadable");
                    notify(ManualNotice::Rejected {
                        errors: vec![format!("could not read {}: {err}", output_path.display())],
                    });
                }
            }
        }

        tick += 1;
        if tick % STILL_WAITING_EVERY == 0 {
            notify(ManualNotice::StillWaiting);
        }
        thread::sleep(poll_interval);
    }
}

/// Text of a submission saved by an arbitrary editor.
///
/// Honors UTF-8 and UTF-16 byte order marks; anything else is read as UTF-8
/// with invalid sequences replaced.
pub fn decode_submission(bytes: &[u8]) -> String {
    fn utf16(body: &[u8], unit: fn([u8; 2]) -> u16) -> String {
        let units: Vec<u16> = body
            .chunks(2)
            .map(|pair| unit([pair[0], pair.get(1).copied().unwrap_or(0)]))
            .collect();
        String::from_utf16_lossy(&units)
    }

    match bytes {
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        [0xFF, 0xFE, rest @ ..] => utf16(rest, u16::from_le_bytes),
        [0xFE, 0xFF, rest @ ..] => utf16(rest, u16::from_be_bytes),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Modification time of a non-empty file not yet examined at that time.
fn fresh_submission(path: &Path, last_seen: Option<SystemTime>) -> Result<Option<SystemTime>> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("stat manual output {}", path.display()));
        }
    };
    if metadata.len() == 0 {
        return Ok(None);
    }
    let modified = metadata
        .modified()
        .with_context(|| format!("mtime of {}", path.display()))?;
    Ok((last_seen != Some(modified)).then_some(modified))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::io::cancel::{Halt, halt_of};
    use crate::io::run_state::StateStore;

    fn token(dir: &Path) -> (CancelToken, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        let store = StateStore::new(dir.join("loop_status.json"));
        (CancelToken::new(store, Arc::clone(&flag)), flag)
    }

    #[test]
    fn handoff_names_command_and_output_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = PhasePaths::new(temp.path(), Phase::Judge);
        write_handoff(&paths, Phase::Judge, "PROMPT", "codex exec -").expect("handoff");

        assert_eq!(
            fs::read_to_string(&paths.manual_prompt_path).expect("prompt"),
            "PROMPT"
        );
        let instructions =
            fs::read_to_string(&paths.manual_instructions_path).expect("instructions");
        assert!(instructions.contains("phase: judge"));
        assert!(instructions.contains("codex exec - < \""));
        assert!(instructions.contains(&paths.manual_output_path.display().to_string()));
    }

    #[test]
    fn accepts_existing_valid_submission() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = PhasePaths::new(temp.path(), Phase::Rewrite);
        fs::write(&paths.manual_output_path, "ok").expect("write");
        let (cancel, _) = token(temp.path());

        let mut notices = Vec::new();
        let (value, raw) = wait_for_submission(
            &paths,
            Phase::Rewrite,
            Duration::from_millis(5),
            &cancel,
            |raw| Ok::<_, Vec<String>>(raw.len()),
            |n| notices.push(n),
        )
        .expect("submission");
        assert_eq!(value, 2);
        assert_eq!(raw, "ok");
        assert!(matches!(notices[0], ManualNotice::Waiting { .. }));
    }

    #[test]
    fn rejected_submission_is_not_reexamined_until_modified() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = PhasePaths::new(temp.path(), Phase::Judge);
        fs::write(&paths.manual_output_path, "bad").expect("write");
        let (cancel, flag) = token(temp.path());

        let mut attempts = 0;
        let mut notices = Vec::new();
        let err = wait_for_submission(
            &paths,
            Phase::Judge,
            Duration::from_millis(2),
            &cancel,
            |_raw: &str| -> Result<(), Vec<String>> {
                attempts += 1;
                Err(vec!["not json".to_string()])
            },
            |n| {
                if n == ManualNotice::StillWaiting {
                    flag.store(true, Ordering::SeqCst);
                }
                notices.push(n);
            },
        )
        .unwrap_err();

        assert_eq!(attempts, 1);
        assert_eq!(halt_of(&err), Some(Halt::Interrupt));
        assert!(notices.contains(&ManualNotice::Rejected {
            errors: vec!["not json".to_string()]
        }));
    }

    #[test]
    fn stop_request_aborts_wait() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = PhasePaths::new(temp.path(), Phase::Judge);
        let (cancel, _) = token(temp.path());
        let state_path = temp.path().join("loop_status.json");

        let stopper = {
            let state_path = state_path.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                fs::write(state_path, "{\"stop_requested\": true}").expect("write stop");
            })
        };
        let err = wait_for_submission(
            &paths,
            Phase::Judge,
            Duration::from_millis(5),
            &cancel,
            |_raw: &str| Ok::<(), Vec<String>>(()),
            |_| {},
        )
        .unwrap_err();
        stopper.join().expect("join");
        assert_eq!(halt_of(&err), Some(Halt::Stop));
    }

    #[test]
    fn decodes_editor_encodings() {
        assert_eq!(decode_submission(b"\xEF\xBB\xBF{\"a\": 1}"), "{\"a\": 1}");
        let le: Vec<u8> = [0xFF, 0xFE]
            .into_iter()
            .chain("{\"é\": 1}".encode_utf16().flat_map(u16::to_le_bytes))
            .collect();
        assert_eq!(decode_submission(&le), "{\"é\": 1}");
        let be: Vec<u8> = [0xFE, 0xFF]
            .into_iter()
            .chain("ok".encode_utf16().flat_map(u16::to_be_bytes))
            .collect();
        assert_eq!(decode_submission(&be), "ok");
        assert_eq!(decode_submission(b"ok \xFF"), "ok \u{FFFD}");
    }

    #[test]
    fn utf16_submission_is_accepted_not_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = PhasePaths::new(temp.path(), Phase::Judge);
        let bytes: Vec<u8> = [0xFF, 0xFE]
            .into_iter()
            .chain("{\"pass\": true}".encode_utf16().flat_map(u16::to_le_bytes))
            .collect();
        fs::write(&paths.manual_output_path, bytes).expect("write");
        let (cancel, _) = token(temp.path());

        let (value, raw) = wait_for_submission(
            &paths,
            Phase::Judge,
            Duration::from_millis(2),
            &cancel,
            |raw| serde_json::from_str::<serde_json::Value>(raw).map_err(|e| vec![e.to_string()]),
            |_| {},
        )
        .expect("submission");
        assert_eq!(value["pass"], true);
        assert_eq!(raw, "{\"pass\": true}");
    }

    #[test]
    fn undecodable_submission_is_rejected_and_wait_continues() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = PhasePaths::new(temp.path(), Phase::Judge);
        fs::write(&paths.manual_output_path, [0xC3, 0x28, 0xFF]).expect("write");
        let (cancel, flag) = token(temp.path());

        let mut notices = Vec::new();
        let err = wait_for_submission(
            &paths,
            Phase::Judge,
            Duration::from_millis(2),
            &cancel,
            |raw| serde_json::from_str::<serde_json::Value>(raw).map_err(|e| vec![e.to_string()]),
            |n| {
                if n == ManualNotice::StillWaiting {
                    flag.store(true, Ordering::SeqCst);
                }
                notices.push(n);
            },
        )
        .unwrap_err();

        // Only cancellation ends the wait.
        assert_eq!(halt_of(&err), Some(Halt::Interrupt));
        assert!(notices.iter().any(|n| matches!(n, ManualNotice::Rejected { .. })));
    }

    #[test]
    fn empty_file_is_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.txt");
        assert!(fresh_submission(&path, None).expect("missing").is_none());
        fs::write(&path, "").expect("write");
        assert!(fresh_submission(&path, None).expect("empty").is_none());
        fs::write(&path, "x").expect("write");
        let seen = fresh_submission(&path, None).expect("fresh").expect("some");
        assert!(fresh_submission(&path, Some(seen)).expect("stale").is_none());
    }
}
