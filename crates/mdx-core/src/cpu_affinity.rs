//! Thread-to-core pinning for the market-data threads.
//!
//! Each data source runs its ticker loop on a dedicated thread; pinning it keeps
//! the shared-memory writes off cores the scheduler is juggling.

use tracing::{info, warn};

/// Bind the current thread to the specified CPU core.
///
/// Returns `false` when the core does not exist or the OS rejects the request.
pub fn bind_to_core(core_id: usize) -> bool {
    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    let Some(core) = core_ids.iter().find(|c| c.id == core_id) else {
        warn!("[affinity] core {core_id} not available ({} cores visible)", core_ids.len());
        return false;
    };
    let ok = core_affinity::set_for_current(*core);
    if ok {
        info!("[affinity] bound {:?} to core {core_id}", std::thread::current().name());
    } else {
        warn!("[affinity] failed to bind to core {core_id}");
    }
    ok
}

/// Bind the current thread if a non-negative core is configured.
pub fn maybe_bind(core_id: Option<i32>) {
    if let Some(id) = core_id
        && id >= 0
    {
        bind_to_core(id as usize);
    }
}
