//! Counting engine double for tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::common::PeerAddress;

use super::{ChannelEngine, ChannelHandler, EngineError, PlainEngine, SessionHandle};

/// Call counters shared between a test and the engine it handed to the proxy
#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    pub allocated: AtomicUsize,
    pub freed: AtomicUsize,
    pub handled: AtomicUsize,
    pub contexts_freed: AtomicUsize,
}

impl EngineCounters {
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn freed(&self) -> usize {
        self.freed.load(Ordering::SeqCst)
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }

    pub fn contexts_freed(&self) -> usize {
        self.contexts_freed.load(Ordering::SeqCst)
    }
}

/// PlainEngine wrapper that counts calls and panics on a double free
pub(crate) struct ScriptedEngine {
    inner: PlainEngine,
    counters: Arc<EngineCounters>,
    live: HashSet<SessionHandle>,
    fail_allocation: bool,
}

impl ScriptedEngine {
    pub fn new(counters: Arc<EngineCounters>) -> Self {
        Self {
            inner: PlainEngine::new(),
            counters,
            live: HashSet::new(),
            fail_allocation: false,
        }
    }

    /// Every `new_session` call fails
    pub fn failing(counters: Arc<EngineCounters>) -> Self {
        Self {
            fail_allocation: true,
            ..Self::new(counters)
        }
    }
}

impl ChannelEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn new_session(&mut self, peer: &PeerAddress) -> Result<SessionHandle, EngineError> {
        if self.fail_allocation {
            return Err(EngineError::Allocation("scripted failure".into()));
        }
        let handle = self.inner.new_session(peer)?;
        self.live.insert(handle);
        self.counters.allocated.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn free_session(&mut self, handle: SessionHandle) {
        assert!(self.live.remove(&handle), "double free of {}", handle);
        self.counters.freed.fetch_add(1, Ordering::SeqCst);
        self.inner.free_session(handle);
    }

    fn handle_message(
        &mut self,
        handle: SessionHandle,
        peer: &PeerAddress,
        datagram: &[u8],
        handler: &mut dyn ChannelHandler,
    ) -> Result<(), EngineError> {
        self.counters.handled.fetch_add(1, Ordering::SeqCst);
        self.inner.handle_message(handle, peer, datagram, handler)
    }

    fn free_context(&mut self) {
        assert!(self.live.is_empty(), "context freed with live sessions");
        self.counters.contexts_freed.fetch_add(1, Ordering::SeqCst);
        self.inner.free_context();
    }
}
