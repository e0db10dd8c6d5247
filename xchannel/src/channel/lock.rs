//! Lock and wait-queue layer serializing access to a channel core.
//!
//! At most one logical operation is ever busy on a channel. Further callers
//! park in a FIFO queue of completion handles; unlocking hands the boxed
//! core to the next waiter through its handle, so exclusive access follows
//! ownership of the box rather than a critical section.
//!
//! Wrapper records form an arena. Index 0 is the main wrapper; `atomic`
//! blocks allocate short-lived secondary records chained to their parent
//! through `BusyAtomic` links. Records are recycled once resolved, with a
//! generation counter so stale handles to a recycled record are rejected.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::channel::core::ChannelCore;
use crate::channel::{Channel, Mode, Output};
use crate::error::{Error, Result};

/// Lifecycle state of one wrapper record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WrapperState {
    /// No operation in progress.
    Idle,
    /// A primitive operation holds the core.
    BusyPrimitive,
    /// An atomic block is in progress through the given secondary record.
    BusyAtomic(usize),
    /// The core was handed to a queued waiter that has not yet resumed.
    WaitingForBusy,
    /// The channel was aborted; every operation fails.
    Closed,
    /// A secondary record whose atomic block has ended.
    Invalid,
}

struct WrapperRec<M: Mode> {
    state: WrapperState,
    generation: u64,
    parent: Option<usize>,
    queue: VecDeque<oneshot::Sender<Box<ChannelCore<M>>>>,
}

impl<M: Mode> WrapperRec<M> {
    fn new(state: WrapperState, generation: u64, parent: Option<usize>) -> Self {
        Self {
            state,
            generation,
            parent,
            queue: VecDeque::new(),
        }
    }
}

/// Mutable lock state guarded by the channel mutex.
#[doc(hidden)]
pub struct LockState<M: Mode> {
    wrappers: Vec<WrapperRec<M>>,
    free: Vec<usize>,
    /// Present whenever the innermost active wrapper is idle.
    core: Option<Box<ChannelCore<M>>>,
    auto_flush: bool,
}

impl<M: Mode> LockState<M> {
    /// Walks the `BusyAtomic` chain from the root to the innermost record.
    fn innermost(&self) -> usize {
        let mut idx = 0;
        while let WrapperState::BusyAtomic(inner) = self.wrappers[idx].state {
            idx = inner;
        }
        idx
    }

    fn alloc_wrapper(&mut self, parent: usize) -> (usize, u64) {
        if let Some(idx) = self.free.pop() {
            let rec = &mut self.wrappers[idx];
            rec.state = WrapperState::Idle;
            rec.parent = Some(parent);
            (idx, rec.generation)
        } else {
            self.wrappers
                .push(WrapperRec::new(WrapperState::Idle, 0, Some(parent)));
            (self.wrappers.len() - 1, 0)
        }
    }

    /// Retires a resolved secondary record. Bumping the generation makes
    /// every remaining handle to it invalid.
    fn recycle(&mut self, idx: usize) {
        let rec = &mut self.wrappers[idx];
        rec.state = WrapperState::Invalid;
        rec.generation += 1;
        rec.parent = None;
        rec.queue.clear();
        self.free.push(idx);
    }
}

/// Shared per-channel state: the lock arena plus the abort token.
#[doc(hidden)]
pub struct Shared<M: Mode> {
    state: Mutex<LockState<M>>,
    abort: CancellationToken,
}

/// RAII grant of exclusive access to the channel core.
///
/// Dropping the guard releases the lock, waking the next queued caller;
/// this also covers operations whose future is dropped mid-flight.
pub(crate) struct CoreGuard<M: Mode> {
    shared: Arc<Shared<M>>,
    idx: usize,
    core: Option<Box<ChannelCore<M>>>,
}

impl<M: Mode> CoreGuard<M> {
    pub(crate) fn core_mut(&mut self) -> &mut ChannelCore<M> {
        self.core.as_mut().expect("lock guard lost its channel core")
    }

    /// Takes the core without releasing the wrapper (atomic setup).
    fn into_core(mut self) -> Box<ChannelCore<M>> {
        self.core.take().expect("lock guard lost its channel core")
    }
}

impl<M: Mode> Drop for CoreGuard<M> {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            Shared::release(&self.shared, self.idx, core);
        }
    }
}

/// A queued caller's receiving end of the lock handoff.
///
/// If the waiting future is dropped after the core was already sent to it,
/// the drop handler releases the core again so the channel cannot deadlock.
struct Handoff<M: Mode> {
    rx: oneshot::Receiver<Box<ChannelCore<M>>>,
    shared: Arc<Shared<M>>,
    idx: usize,
    done: bool,
}

impl<M: Mode> Drop for Handoff<M> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.rx.close();
        if let Ok(core) = self.rx.try_recv() {
            Shared::release(&self.shared, self.idx, core);
        }
    }
}

impl<M: Mode> Shared<M> {
    pub(crate) fn new(core: Box<ChannelCore<M>>) -> Arc<Self> {
        Arc::new(Self {
            abort: core.abort_handle(),
            state: Mutex::new(LockState {
                wrappers: vec![WrapperRec::new(WrapperState::Idle, 0, None)],
                free: Vec::new(),
                core: Some(core),
                auto_flush: false,
            }),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState<M>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock_state().wrappers[0].state == WrapperState::Closed
    }

    /// Claims the busy lock on wrapper `idx`, parking FIFO if necessary.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        idx: usize,
        generation: u64,
    ) -> Result<CoreGuard<M>> {
        let rx = {
            let mut st = self.lock_state();
            if st.wrappers[0].state == WrapperState::Closed {
                return Err(Error::Closed);
            }
            if st.wrappers[idx].generation != generation {
                return Err(Error::InvalidChannel);
            }
            match st.wrappers[idx].state {
                WrapperState::Closed => return Err(Error::Closed),
                WrapperState::Invalid => return Err(Error::InvalidChannel),
                WrapperState::Idle => {
                    return match st.core.take() {
                        Some(core) => {
                            st.wrappers[idx].state = WrapperState::BusyPrimitive;
                            Ok(CoreGuard {
                                shared: self.clone(),
                                idx,
                                core: Some(core),
                            })
                        }
                        // An idle record without the core is a detached
                        // remnant of a finished atomic chain.
                        None => Err(Error::InvalidChannel),
                    };
                }
                WrapperState::BusyPrimitive
                | WrapperState::BusyAtomic(_)
                | WrapperState::WaitingForBusy => {
                    let (tx, rx) = oneshot::channel();
                    st.wrappers[idx].queue.push_back(tx);
                    rx
                }
            }
        };

        let mut handoff = Handoff {
            rx,
            shared: self.clone(),
            idx,
            done: false,
        };
        match (&mut handoff.rx).await {
            Ok(core) => {
                handoff.done = true;
                let mut st = self.lock_state();
                match st.wrappers[idx].state {
                    WrapperState::Closed => {
                        drop(st);
                        Self::release(self, idx, core);
                        Err(Error::Closed)
                    }
                    WrapperState::Invalid => {
                        drop(st);
                        Self::release(self, idx, core);
                        Err(Error::InvalidChannel)
                    }
                    _ => {
                        st.wrappers[idx].state = WrapperState::BusyPrimitive;
                        drop(st);
                        Ok(CoreGuard {
                            shared: self.clone(),
                            idx,
                            core: Some(core),
                        })
                    }
                }
            }
            Err(_) => {
                handoff.done = true;
                let st = self.lock_state();
                if st.wrappers[idx].generation != generation
                    || st.wrappers[idx].state == WrapperState::Invalid
                {
                    Err(Error::InvalidChannel)
                } else {
                    Err(Error::Closed)
                }
            }
        }
    }

    /// Returns the core after an operation, waking the next queued caller.
    pub(crate) fn release(self: &Arc<Self>, idx: usize, core: Box<ChannelCore<M>>) {
        let mut st = self.lock_state();
        self.release_locked(&mut st, idx, core);
    }

    fn release_locked(
        self: &Arc<Self>,
        st: &mut LockState<M>,
        mut idx: usize,
        mut core: Box<ChannelCore<M>>,
    ) {
        loop {
            match st.wrappers[idx].state {
                WrapperState::Closed => {
                    // The channel was aborted while this operation was in
                    // flight; whoever holds the core owns disposal.
                    match tokio::runtime::Handle::try_current() {
                        Ok(handle) => {
                            handle.spawn(core.dispose());
                        }
                        Err(_) => {
                            log::debug!(
                                "no runtime at release time; dropping {} channel resources",
                                M::NAME
                            );
                            drop(core);
                        }
                    }
                    return;
                }
                WrapperState::Invalid => {
                    // A finished atomic block left this record unresolved
                    // because the core was still out; resolve it and hand
                    // the core to the owning wrapper.
                    let parent = st.wrappers[idx].parent.unwrap_or(0);
                    st.recycle(idx);
                    idx = parent;
                }
                _ => break,
            }
        }
        while let Some(tx) = st.wrappers[idx].queue.pop_front() {
            match tx.send(core) {
                Ok(()) => {
                    st.wrappers[idx].state = WrapperState::WaitingForBusy;
                    return;
                }
                // That caller went away before being woken; try the next.
                Err(returned) => core = returned,
            }
        }
        st.wrappers[idx].state = WrapperState::Idle;
        st.core = Some(core);
        M::on_idle(self, st);
    }

    /// Runs `f` as an atomic block through a fresh secondary wrapper.
    pub(crate) async fn atomic<R, F>(
        self: &Arc<Self>,
        idx: usize,
        generation: u64,
        f: F,
    ) -> Result<R>
    where
        F: AsyncFnOnce(Channel<M>) -> Result<R>,
    {
        let guard = Self::acquire(self, idx, generation).await?;
        let core = guard.into_core();
        let inner = {
            let mut st = self.lock_state();
            if st.wrappers[0].state == WrapperState::Closed {
                drop(st);
                Self::release(self, idx, core);
                return Err(Error::Closed);
            }
            let (inner_idx, inner_generation) = st.alloc_wrapper(idx);
            st.wrappers[idx].state = WrapperState::BusyAtomic(inner_idx);
            st.core = Some(core);
            Channel {
                shared: self.clone(),
                idx: inner_idx,
                generation: inner_generation,
            }
        };
        let inner_idx = inner.idx;
        let result = f(inner).await;
        self.finish_atomic(idx, inner_idx);
        result
    }

    /// Invalidates the secondary wrapper of a finished atomic block and
    /// unlocks its parent.
    fn finish_atomic(self: &Arc<Self>, outer_idx: usize, inner_idx: usize) {
        let mut st = self.lock_state();
        if st.wrappers[0].state == WrapperState::Closed {
            // Abort already failed every waiter and owns disposal.
            return;
        }
        // Anything still queued on the temporary wrapper fails.
        st.wrappers[inner_idx].queue.clear();
        match st.core.take() {
            Some(core) => {
                st.recycle(inner_idx);
                st.wrappers[outer_idx].state = WrapperState::BusyPrimitive;
                self.release_locked(&mut st, outer_idx, core);
            }
            None => {
                // A straggling clone of the temporary handle still runs an
                // operation; its release resolves this record and unlocks
                // the parent.
                st.wrappers[inner_idx].state = WrapperState::Invalid;
            }
        }
    }

    /// Aborts the channel rooted at this shared state.
    pub(crate) async fn abort(self: &Arc<Self>) -> Result<()> {
        let core = {
            let mut st = self.lock_state();
            if st.wrappers[0].state == WrapperState::Closed {
                return Ok(());
            }
            for rec in st.wrappers.iter_mut() {
                rec.state = WrapperState::Closed;
                rec.queue.clear();
            }
            st.core.take()
        };
        self.abort.cancel();
        M::on_abort(self);
        log::debug!("{} channel aborted", M::NAME);
        if let Some(core) = core {
            core.dispose().await;
        }
        Ok(())
    }
}

/// Arms the auto-flush task for an output channel that just went idle with
/// buffered bytes and an empty wait queue. Called with the state mutex held.
pub(crate) fn schedule_auto_flush(shared: &Arc<Shared<Output>>, st: &mut LockState<Output>) {
    if st.auto_flush {
        return;
    }
    let pending = st
        .core
        .as_ref()
        .is_some_and(|core| core.pending_bytes() > 0 && core.is_backed());
    if !pending {
        return;
    }
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    st.auto_flush = true;
    let shared = shared.clone();
    handle.spawn(auto_flush(shared));
}

/// Background flush: yields exactly once, then flushes if the channel is
/// still idle, cancelling silently otherwise.
async fn auto_flush(shared: Arc<Shared<Output>>) {
    tokio::task::yield_now().await;
    let (idx, mut core) = {
        let mut st = shared.lock_state();
        st.auto_flush = false;
        let idx = st.innermost();
        if st.wrappers[idx].state != WrapperState::Idle {
            return;
        }
        match st.core.take() {
            Some(core) => {
                st.wrappers[idx].state = WrapperState::BusyPrimitive;
                (idx, core)
            }
            None => return,
        }
    };
    log::trace!("auto-flush draining {} buffered bytes", core.pending_bytes());
    core.safe_flush_total().await;
    Shared::release(&shared, idx, core);
}
