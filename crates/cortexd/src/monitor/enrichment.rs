//! Background alert enrichment.
//!
//! Each task runs on its own named thread, asks the inference backend about
//! one alert, and stores the answer as a linked `ai-analysis` alert. Tasks
//! hold only weak references; if the store is gone or the monitor has
//! stopped by the time the answer arrives, the answer is dropped.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use cortex_common::alert::{Alert, AlertCategory, META_AI_ENHANCED, META_PARENT_ALERT_ID};
use tracing::{debug, warn};

use crate::alert_store::AlertStore;
use crate::inference::{InferenceClient, InferenceRequest};

/// Source recorded on enrichment alerts
pub const ENRICHMENT_SOURCE: &str = "ai_analysis";

pub(crate) struct EnrichmentTask {
    handle: JoinHandle<()>,
    done: Arc<AtomicBool>,
}

impl EnrichmentTask {
    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub(crate) fn join(self) {
        if self.handle.join().is_err() {
            warn!("[MONITOR] Enrichment thread panicked");
        }
    }
}

/// Sets the done flag however the thread exits
struct DoneGuard(Arc<AtomicBool>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Build the ai-analysis alert linked to `parent`
pub fn analysis_alert(parent: &Alert, analysis: &str) -> Alert {
    Alert::new(
        parent.severity,
        AlertCategory::AiAnalysis,
        ENRICHMENT_SOURCE,
        format!("AI analysis: {}", parent.message),
    )
    .with_description(analysis)
    .with_metadata(META_PARENT_ALERT_ID, parent.id.clone())
    .with_metadata(META_AI_ENHANCED, "true")
    .with_metadata("parent_category", parent.category.as_str())
}

pub(crate) fn spawn(
    parent: Alert,
    request: InferenceRequest,
    client: Arc<dyn InferenceClient>,
    store: Weak<AlertStore>,
    running: Weak<AtomicBool>,
) -> io::Result<EnrichmentTask> {
    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();

    let handle = thread::Builder::new()
        .name("cortexd-enrich".to_string())
        .spawn(move || {
            let _guard = DoneGuard(flag);
            let result = client.generate(&request);

            let still_running = running
                .upgrade()
                .map(|r| r.load(Ordering::SeqCst))
                .unwrap_or(false);
            if !still_running {
                debug!("[MONITOR] Monitor stopped, discarding analysis for {}", parent.id);
                return;
            }
            let Some(store) = store.upgrade() else {
                debug!("[MONITOR] Alert store gone, discarding analysis for {}", parent.id);
                return;
            };

            if !result.success {
                debug!(
                    "[MONITOR] No analysis for {}: {}",
                    parent.id,
                    result.error.as_deref().unwrap_or("unknown error")
                );
                return;
            }

            match store.create(analysis_alert(&parent, &result.output)) {
                Ok(alert) => debug!("[MONITOR] Stored analysis {} for {}", alert.id, parent.id),
                Err(e) => warn!("[MONITOR] Failed to store analysis for {}: {}", parent.id, e),
            }
        })?;

    Ok(EnrichmentTask { handle, done })
}
