//! Cooperative cancellation.
//!
//! Two sources can end a run early: a persisted `stop_requested` flag (set by
//! `planloop stop` or by hand) and an in-process interrupt flag (set from the
//! Ctrl-C handler). Both are observed at checkpoints and surface as a [`Halt`]
//! error that the round driver recovers with `downcast_ref`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use tracing::info;

use super::run_state::StateStore;

/// Why a run was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Halt {
    #[error("stop requested")]
    Stop,
    #[error("interrupted")]
    Interrupt,
}

/// Checks both cancellation sources.
#[derive(Debug, Clone)]
pub struct CancelToken {
    store: StateStore,
    interrupted: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new(store: StateStore, interrupted: Arc<AtomicBool>) -> Self {
        Self { store, interrupted }
    }

    /// The in-process interrupt flag, shared with the signal handler.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    /// `Err(Halt)` when the run should stop now. Interrupt wins over stop.
    pub fn check(&self) -> Result<()> {
        if self.interrupted.load(Ordering::SeqCst) {
            info!("interrupt observed");
            return Err(Halt::Interrupt.into());
        }
        if self.store.stop_requested() {
            info!(path = %self.store.path().display(), "stop request observed");
            return Err(Halt::Stop.into());
        }
        Ok(())
    }
}

/// The halt signal carried by `err`, if any.
pub fn halt_of(err: &anyhow::Error) -> Option<Halt> {
    err.downcast_ref::<Halt>().copied()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn check_passes_without_flags() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(temp.path().join("loop_status.json"));
        let token = CancelToken::new(store, Arc::new(AtomicBool::new(false)));
        token.check().expect("no halt");
    }

    #[test]
    fn persisted_stop_flag_halts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("loop_status.json");
        fs::write(&path, "{\"stop_requested\": true}").expect("write");
        let token = CancelToken::new(StateStore::new(path), Arc::new(AtomicBool::new(false)));

        let err = token.check().unwrap_err();
        assert_eq!(halt_of(&err), Some(Halt::Stop));
    }

    #[test]
    fn interrupt_takes_precedence() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("loop_status.json");
        fs::write(&path, "{\"stop_requested\": true}").expect("write");
        let flag = Arc::new(AtomicBool::new(false));
        let token = CancelToken::new(StateStore::new(path), Arc::clone(&flag));
        flag.store(true, Ordering::SeqCst);

        let err = token.check().unwrap_err();
        assert_eq!(halt_of(&err), Some(Halt::Interrupt));
    }

    #[test]
    fn halt_survives_added_context() {
        use anyhow::Context;
        let err = Err::<(), _>(anyhow::Error::from(Halt::Stop))
            .context("manual judge wait")
            .unwrap_err();
        assert_eq!(halt_of(&err), Some(Halt::Stop));
        assert_eq!(halt_of(&anyhow::anyhow!("boom")), None);
    }
}
