//! Process-wide registry of live output channels.
//!
//! Every transported output channel registers itself at construction and
//! deregisters when it is aborted; entries whose channel became unreachable
//! without an explicit close drop out on the next sweep. Applications call
//! [`flush_all_outputs`] once before shutting the runtime down so that no
//! buffered output is lost at process exit.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use crate::channel::lock::Shared;
use crate::channel::{Channel, Output};

static OUTPUTS: OnceLock<Mutex<Vec<Weak<Shared<Output>>>>> = OnceLock::new();

fn entries() -> MutexGuard<'static, Vec<Weak<Shared<Output>>>> {
    let mutex = OUTPUTS.get_or_init(|| Mutex::new(Vec::new()));
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Adds a freshly constructed output channel.
pub(crate) fn register(shared: &Arc<Shared<Output>>) {
    let mut outputs = entries();
    outputs.retain(|weak| weak.strong_count() > 0);
    outputs.push(Arc::downgrade(shared));
    log::trace!("registered output channel ({} live)", outputs.len());
}

/// Removes an aborted output channel.
pub(crate) fn deregister(shared: &Arc<Shared<Output>>) {
    let mut outputs = entries();
    outputs.retain(|weak| weak.strong_count() > 0 && !Weak::ptr_eq(weak, &Arc::downgrade(shared)));
}

/// Flushes every registered output channel once.
///
/// Intended for process shutdown, before the runtime stops; failures are
/// suppressed so one broken channel cannot block the others from flushing.
pub async fn flush_all_outputs() {
    let live: Vec<Arc<Shared<Output>>> = {
        let mut outputs = entries();
        outputs.retain(|weak| weak.strong_count() > 0);
        outputs.iter().filter_map(Weak::upgrade).collect()
    };
    log::debug!("flushing {} registered output channels", live.len());
    for shared in live {
        let channel = Channel::<Output>::from_shared(shared);
        if let Err(e) = channel.flush().await {
            log::debug!("suppressed flush failure during shutdown sweep: {e}");
        }
    }
}
