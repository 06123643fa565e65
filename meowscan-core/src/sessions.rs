//! Many independent detection sessions sharing one template library.
//!
//! This is the push-style entry point for hosts that multiplex several
//! capture streams: `submit_samples(session, samples, rate)` appends and runs
//! one tick for that session, returning the events it produced.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    engine::{DetectionEngine, EngineConfig},
    error::{MeowError, Result},
    ipc::events::{DetectorEvent, DetectorState},
    library::TemplateLibrary,
};

type SessionHandle = Arc<Mutex<DetectionEngine>>;

/// Registry of live sessions, keyed by caller-chosen id.
///
/// `SessionRegistry` is `Send + Sync`; the map lock is held only for lookups,
/// so sessions tick independently.
pub struct SessionRegistry {
    config: EngineConfig,
    library: Arc<TemplateLibrary>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(config: EngineConfig, library: Arc<TemplateLibrary>) -> Result<Self> {
        // Fail here rather than on the first start_session.
        DetectionEngine::with_library(config.clone(), Arc::clone(&library))?;
        Ok(Self {
            config,
            library,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Create and start a session. Returns a receiver for its events.
    pub fn start_session(&self, id: &str) -> Result<broadcast::Receiver<DetectorEvent>> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(id) {
            return Err(MeowError::InvalidState(format!("session {id} already running")));
        }
        let mut engine = DetectionEngine::with_library(self.config.clone(), Arc::clone(&self.library))?;
        let rx = engine.subscribe();
        engine.start()?;
        sessions.insert(id.to_string(), Arc::new(Mutex::new(engine)));
        info!(session = id, "session started");
        Ok(rx)
    }

    /// Append samples to a session and run one tick.
    pub fn submit_samples(
        &self,
        id: &str,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<Vec<DetectorEvent>> {
        let handle = self.handle(id)?;
        let mut engine = handle.lock();
        engine.submit_samples(samples, sample_rate)?;
        Ok(engine.tick())
    }

    /// Stop and remove a session. Returns the final events (`→ Idle`).
    pub fn stop_session(&self, id: &str) -> Result<Vec<DetectorEvent>> {
        let handle = self
            .sessions
            .lock()
            .remove(id)
            .ok_or_else(|| MeowError::UnknownSession(id.to_string()))?;
        let mut engine = handle.lock();
        if engine.state() == DetectorState::Error {
            engine.reset()?;
        } else {
            engine.stop()?;
        }
        info!(session = id, "session stopped");
        Ok(engine.drain_events())
    }

    /// Recover a session from `Error` and start it again.
    pub fn reset_session(&self, id: &str) -> Result<Vec<DetectorEvent>> {
        let handle = self.handle(id)?;
        let mut engine = handle.lock();
        engine.reset()?;
        engine.start()?;
        Ok(engine.drain_events())
    }

    pub fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<DetectorEvent>> {
        Ok(self.handle(id)?.lock().subscribe())
    }

    pub fn state(&self, id: &str) -> Result<DetectorState> {
        Ok(self.handle(id)?.lock().state())
    }

    /// Ids of live sessions, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handle(&self, id: &str) -> Result<SessionHandle> {
        self.sessions
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| MeowError::UnknownSession(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureExtractor;
    use crate::library::Template;

    const SR: u32 = 8_000;

    fn registry() -> SessionRegistry {
        let config = EngineConfig {
            sample_rate: SR,
            ..EngineConfig::default()
        };
        let extractor = FeatureExtractor::new(config.feature_config()).unwrap();
        let tone: Vec<f32> = (0..SR as usize)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 600.0 * i as f32 / SR as f32).sin())
            .collect();
        let features = extractor.extract(&tone).unwrap();
        let library =
            TemplateLibrary::from_templates(vec![Template::new("hungry", "t", features)], SR)
                .unwrap();
        SessionRegistry::new(config, Arc::new(library)).unwrap()
    }

    #[test]
    fn sessions_are_independent() {
        let reg = registry();
        reg.start_session("kitchen").unwrap();
        reg.start_session("garden").unwrap();
        assert_eq!(reg.session_ids(), vec!["garden", "kitchen"]);

        let loud = vec![0.5f32; SR as usize / 10];
        let events = reg.submit_samples("kitchen", &loud, SR).unwrap();
        assert!(events
            .iter()
            .any(|e| e.new_state() == Some(DetectorState::Recording)));
        assert_eq!(reg.state("kitchen").unwrap(), DetectorState::Recording);
        assert_eq!(reg.state("garden").unwrap(), DetectorState::Listening);
    }

    #[test]
    fn duplicate_and_unknown_sessions_are_rejected() {
        let reg = registry();
        reg.start_session("a").unwrap();
        assert!(matches!(
            reg.start_session("a"),
            Err(MeowError::InvalidState(_))
        ));
        assert!(matches!(
            reg.submit_samples("b", &[0.0; 4], SR),
            Err(MeowError::UnknownSession(_))
        ));
        assert!(matches!(reg.state("b"), Err(MeowError::UnknownSession(_))));
    }

    #[test]
    fn stop_removes_session_and_reports_idle() {
        let reg = registry();
        let mut rx = reg.start_session("a").unwrap();
        let events = reg.stop_session("a").unwrap();
        assert_eq!(events.last().and_then(|e| e.new_state()), Some(DetectorState::Idle));
        assert!(reg.is_empty());
        assert!(matches!(reg.stop_session("a"), Err(MeowError::UnknownSession(_))));

        // Receiver saw the whole lifecycle.
        assert_eq!(rx.try_recv().unwrap().new_state(), Some(DetectorState::Listening));
        assert_eq!(rx.try_recv().unwrap().new_state(), Some(DetectorState::Idle));
    }

    #[test]
    fn non_finite_input_is_a_contract_error() {
        let reg = registry();
        reg.start_session("a").unwrap();
        let err = reg.submit_samples("a", &[0.1, f32::NAN], SR).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Contract);
        assert_eq!(reg.state("a").unwrap(), DetectorState::Listening);
    }

    #[test]
    fn mismatched_library_rate_fails_at_construction() {
        let reg = registry();
        let config = EngineConfig::default();
        assert!(matches!(
            SessionRegistry::new(config, Arc::clone(&reg.library)),
            Err(MeowError::InvalidConfig(_))
        ));
    }
}
