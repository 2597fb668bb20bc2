//! Watch multiplexing: bundle watch streams in, change descriptors out.

use anyhow::{anyhow, Result};
use metrics::counter;
use tracing::{debug, warn};

use configmaster_core::{ChangeDescriptor, WatchEventType};
use configmaster_debounce::Debouncer;
use configmaster_kubehub::WatchHandle;

/// Forward every named modification on `watch` to the change debouncer.
///
/// Runs until the stream ends, which is always reported as an error: the
/// controller has no way to resubscribe on its own.
pub async fn forward_modifications(mut watch: WatchHandle, changes: Debouncer<ChangeDescriptor>) -> Result<()> {
    let kind = watch.kind;
    while let Some(item) = watch.rx.recv().await {
        let ev = match item {
            Ok(ev) => ev,
            Err(e) => {
                warn!(kind = %kind, error = %e, "watch stream error");
                continue;
            }
        };
        match ev.modification(kind) {
            Some(change) => {
                counter!("configmaster_changes_seen_total").increment(1);
                changes.notify(change)?;
            }
            None if ev.event_type == WatchEventType::Modified => {
                warn!(kind = %kind, "modified event without a name; skipping");
            }
            None => debug!(kind = %kind, event = ?ev.event_type, name = ?ev.name, "ignoring event"),
        }
    }
    Err(anyhow!("{} watch stream ended", kind))
}
