//! Device session establishment and model loading.
//!
//! The device runtime often needs a few seconds after boot (or after another
//! process released it) before a session can be opened, so establishment waits
//! before every attempt: a short warm-up first, a longer back-off afterwards.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::engine::{EngineSession, FrameGeometry, InferenceEngine, VisionModel};
use crate::error::{BackendError, EngineError};

/// Granularity of interruptible waits.
const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub warmup: Duration,
    pub retry_wait: Duration,
}

impl RetryPolicy {
    fn wait_before(&self, attempt: u32) -> Duration {
        if attempt == 1 {
            self.warmup
        } else {
            self.retry_wait
        }
    }
}

/// A live session with its loaded model.
///
/// Field order matters: the model is dropped before the session it was
/// loaded on.
pub struct LoadedModel {
    pub model: Box<dyn VisionModel>,
    _session: Box<dyn EngineSession>,
    geometry: FrameGeometry,
}

impl LoadedModel {
    /// Input geometry queried once at load time.
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }
}

/// Establish a session with bounded retries.
///
/// Waits are cut short when `running` is cleared; that surfaces as
/// [`BackendError::Interrupted`].
pub fn establish(
    engine: &mut dyn InferenceEngine,
    policy: &RetryPolicy,
    running: &AtomicBool,
) -> Result<Box<dyn EngineSession>, BackendError> {
    info!("[SESSION] Scanning devices...");
    match engine.scan_devices() {
        Ok(ids) if ids.is_empty() => {
            error!("[SESSION] No devices found");
            return Err(EngineError::NoDevice.into());
        }
        Ok(ids) => {
            for id in &ids {
                info!("[SESSION] Device: {id}");
            }
        }
        Err(e) => warn!("[SESSION] Device scan failed ({e}), trying to connect anyway"),
    }

    let mut last_error = String::from("no attempt made");
    for attempt in 1..=policy.max_attempts {
        let wait = policy.wait_before(attempt);
        info!(
            "[SESSION] Waiting {wait:?} before attempt {attempt}/{}",
            policy.max_attempts
        );
        if !sleep_while_running(wait, running) {
            return Err(BackendError::Interrupted);
        }

        match engine.create_session() {
            Ok(session) => {
                info!("[SESSION] Session established on attempt {attempt}");
                return Ok(session);
            }
            Err(e) => {
                warn!("[SESSION] Attempt {attempt}/{} failed: {e}", policy.max_attempts);
                last_error = e.to_string();
            }
        }
    }

    error!("[SESSION] FATAL: cannot establish a device session");
    Err(BackendError::SessionExhausted {
        attempts: policy.max_attempts,
        last: last_error,
    })
}

/// Load the model and query its input geometry.
pub fn load_model(
    mut session: Box<dyn EngineSession>,
    path: &Path,
) -> Result<LoadedModel, BackendError> {
    info!("[SESSION] Loading model: {}", path.display());
    let model = session.load_model(path)?;
    let geometry = model.input_geometry();
    info!(
        "[SESSION] Model ready. Frame: {}x{} ({} bytes)",
        geometry.height,
        geometry.width,
        geometry.frame_size()
    );
    Ok(LoadedModel {
        model,
        _session: session,
        geometry,
    })
}

/// Standalone device check: scan, then open and release a session.
pub fn diagnose(engine: &mut dyn InferenceEngine) -> Result<Vec<String>, EngineError> {
    info!("[DIAG] ===== Device Diagnostics =====");
    let ids = engine.scan_devices()?;
    if ids.is_empty() {
        error!("[DIAG] No devices.");
        return Err(EngineError::NoDevice);
    }
    for id in &ids {
        info!("[DIAG] Device: {id}");
    }
    drop(engine.create_session()?);
    info!("[DIAG] OK");
    Ok(ids)
}

/// Sleep up to `total`, returning `false` as soon as `running` is cleared.
pub(crate) fn sleep_while_running(total: Duration, running: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(WAIT_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            warmup: Duration::from_millis(1),
            retry_wait: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_establish_retries_until_success() {
        let mut engine = MockEngine::new().with_session_failures(2);
        let handle = engine.handle();
        let running = AtomicBool::new(true);
        assert!(establish(&mut engine, &fast_policy(5), &running).is_ok());
        assert_eq!(handle.session_attempts(), 3);
    }

    #[test]
    fn test_establish_gives_up_after_max_attempts() {
        let mut engine = MockEngine::new().with_session_failures(10);
        let handle = engine.handle();
        let running = AtomicBool::new(true);
        let err = establish(&mut engine, &fast_policy(3), &running).err().unwrap();
        assert!(matches!(err, BackendError::SessionExhausted { attempts: 3, .. }));
        assert_eq!(handle.session_attempts(), 3);
    }

    #[test]
    fn test_no_devices_is_fatal() {
        let mut engine = MockEngine::new().with_devices(vec![]);
        let running = AtomicBool::new(true);
        let err = establish(&mut engine, &fast_policy(3), &running).err().unwrap();
        assert!(matches!(err, BackendError::Engine(EngineError::NoDevice)));
    }

    #[test]
    fn test_scan_failure_is_not_fatal() {
        let mut engine = MockEngine::new().with_scan_failure();
        let running = AtomicBool::new(true);
        assert!(establish(&mut engine, &fast_policy(1), &running).is_ok());
    }

    #[test]
    fn test_shutdown_interrupts_warmup() {
        let mut engine = MockEngine::new();
        let handle = engine.handle();
        let running = AtomicBool::new(false);
        let policy = RetryPolicy {
            max_attempts: 5,
            warmup: Duration::from_secs(30),
            retry_wait: Duration::from_secs(30),
        };
        let started = Instant::now();
        let err = establish(&mut engine, &policy, &running).err().unwrap();
        assert!(matches!(err, BackendError::Interrupted));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(handle.session_attempts(), 0);
    }

    #[test]
    fn test_load_model_reports_geometry() {
        let mut engine = MockEngine::new().with_geometry(FrameGeometry::new(448, 448));
        let running = AtomicBool::new(true);
        let session = establish(&mut engine, &fast_policy(1), &running).unwrap();
        let loaded = load_model(session, Path::new("model.hef")).unwrap();
        assert_eq!(loaded.geometry(), FrameGeometry::new(448, 448));
    }

    #[test]
    fn test_load_model_failure_is_fatal() {
        let mut engine = MockEngine::new().with_model_load_failure();
        let running = AtomicBool::new(true);
        let session = establish(&mut engine, &fast_policy(1), &running).unwrap();
        assert!(matches!(
            load_model(session, Path::new("missing.hef")),
            Err(BackendError::Engine(EngineError::ModelLoad(_)))
        ));
    }

    #[test]
    fn test_diagnose_lists_devices() {
        let mut engine = MockEngine::new();
        assert_eq!(diagnose(&mut engine).unwrap(), vec!["mock-0000:01:00.0"]);
        let mut none = MockEngine::new().with_devices(vec![]);
        assert_eq!(diagnose(&mut none).unwrap_err(), EngineError::NoDevice);
    }
}
