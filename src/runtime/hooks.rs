//! Observability hooks invoked at fixed points of a node's flow
//!
//! A hook receives the node name, the depth of the queue involved, and the
//! meta. Hooks run synchronously on the thread that reached the hook point
//! (an upstream dispatch thread for `arriving`, the node's own threads for the
//! rest), so they must return quickly.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::meta::Meta;

/// Callback signature shared by all hook points
pub type MetaHook = Arc<dyn Fn(&str, usize, &Meta) + Send + Sync>;

/// The four places a hook can be attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Meta pushed onto the ingress queue; depth is ingress after the push
    Arriving,
    /// Meta about to be handed to the stage; depth is ingress including it
    BeforeHandle,
    /// Result pushed onto the egress queue; depth is egress after the push
    AfterHandle,
    /// Meta about to be fanned out; depth is egress including it
    Leaving,
}

impl HookPoint {
    pub const ALL: [HookPoint; 4] = [
        HookPoint::Arriving,
        HookPoint::BeforeHandle,
        HookPoint::AfterHandle,
        HookPoint::Leaving,
    ];

    fn slot(self) -> usize {
        match self {
            HookPoint::Arriving => 0,
            HookPoint::BeforeHandle => 1,
            HookPoint::AfterHandle => 2,
            HookPoint::Leaving => 3,
        }
    }
}

/// Hook slots for one node
#[derive(Clone, Default)]
pub struct Hooks {
    slots: [Option<MetaHook>; 4],
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` at `point`, replacing any previous hook there
    pub fn with(
        mut self,
        point: HookPoint,
        hook: impl Fn(&str, usize, &Meta) + Send + Sync + 'static,
    ) -> Self {
        self.slots[point.slot()] = Some(Arc::new(hook));
        self
    }

    pub fn on_arriving(self, hook: impl Fn(&str, usize, &Meta) + Send + Sync + 'static) -> Self {
        self.with(HookPoint::Arriving, hook)
    }

    pub fn on_before_handle(
        self,
        hook: impl Fn(&str, usize, &Meta) + Send + Sync + 'static,
    ) -> Self {
        self.with(HookPoint::BeforeHandle, hook)
    }

    pub fn on_after_handle(
        self,
        hook: impl Fn(&str, usize, &Meta) + Send + Sync + 'static,
    ) -> Self {
        self.with(HookPoint::AfterHandle, hook)
    }

    pub fn on_leaving(self, hook: impl Fn(&str, usize, &Meta) + Send + Sync + 'static) -> Self {
        self.with(HookPoint::Leaving, hook)
    }

    pub fn is_set(&self, point: HookPoint) -> bool {
        self.slots[point.slot()].is_some()
    }

    #[inline]
    pub(crate) fn fire(&self, point: HookPoint, node: &str, depth: usize, meta: &Meta) {
        if let Some(hook) = &self.slots[point.slot()] {
            hook(node, depth, meta);
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let set: Vec<_> = HookPoint::ALL
            .iter()
            .filter(|p| self.is_set(**p))
            .collect();
        write!(f, "Hooks{:?}", set)
    }
}

#[derive(Default)]
struct ProbeState {
    counts: [AtomicU64; 4],
    peak_depth: [AtomicUsize; 4],
}

/// Counts metas and tracks peak queue depth at every hook point.
///
/// Cheap to clone; all clones share the same counters. Uses only relaxed
/// atomics so it can sit on the hot path.
#[derive(Clone, Default)]
pub struct MetaProbe {
    state: Arc<ProbeState>,
}

impl MetaProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hook set that feeds this probe at all four points
    pub fn hooks(&self) -> Hooks {
        HookPoint::ALL.iter().fold(Hooks::new(), |hooks, &point| {
            let state = Arc::clone(&self.state);
            hooks.with(point, move |_node, depth, _meta| {
                state.counts[point.slot()].fetch_add(1, Ordering::Relaxed);
                state.peak_depth[point.slot()].fetch_max(depth, Ordering::Relaxed);
            })
        })
    }

    pub fn count(&self, point: HookPoint) -> u64 {
        self.state.counts[point.slot()].load(Ordering::Relaxed)
    }

    pub fn peak_depth(&self, point: HookPoint) -> usize {
        self.state.peak_depth[point.slot()].load(Ordering::Relaxed)
    }
}

impl fmt::Debug for MetaProbe {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MetaProbe")
            .field("arriving", &self.count(HookPoint::Arriving))
            .field("before_handle", &self.count(HookPoint::BeforeHandle))
            .field("after_handle", &self.count(HookPoint::AfterHandle))
            .field("leaving", &self.count(HookPoint::Leaving))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::meta::{ControlMeta, FrameMeta};
    use std::sync::Mutex;

    #[test]
    fn test_fire_only_registered_point() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_hook = Arc::clone(&seen);
        let hooks = Hooks::new().on_leaving(move |node, depth, meta| {
            seen_hook
                .lock()
                .unwrap()
                .push((node.to_string(), depth, meta.to_string()));
        });

        let meta = Meta::from(ControlMeta::start());
        hooks.fire(HookPoint::Arriving, "src", 1, &meta);
        hooks.fire(HookPoint::Leaving, "src", 2, &meta);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![("src".to_string(), 2, "Control[start, ch=0]".to_string())]
        );
        assert!(hooks.is_set(HookPoint::Leaving));
        assert!(!hooks.is_set(HookPoint::Arriving));
    }

    #[test]
    fn test_probe_counts_and_peaks() {
        let probe = MetaProbe::new();
        let hooks = probe.hooks();
        let meta = Meta::from(FrameMeta::empty(1, 0));

        hooks.fire(HookPoint::Arriving, "n", 1, &meta);
        hooks.fire(HookPoint::Arriving, "n", 4, &meta);
        hooks.fire(HookPoint::Arriving, "n", 2, &meta);
        hooks.fire(HookPoint::AfterHandle, "n", 1, &meta);

        assert_eq!(probe.count(HookPoint::Arriving), 3);
        assert_eq!(probe.peak_depth(HookPoint::Arriving), 4);
        assert_eq!(probe.count(HookPoint::AfterHandle), 1);
        assert_eq!(probe.count(HookPoint::Leaving), 0);
    }
}
