//! Stream metadata and the shared EOS reference counter.
//!
//! Metadata travels with buffers across port boundaries. An EOS may be
//! duplicated into a peer container; both copies then share one
//! [`SharedEos`] tracker whose destroy callback runs exactly once, when the
//! last holder releases it.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// EOS flavour flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct EosFlags {
    /// Flushing EOS: input is blocked until it drains.
    pub flushing: bool,
    /// Synthesized by the framework, not the client.
    pub internal: bool,
}

impl EosFlags {
    /// Flushing + internal, as injected on state changes.
    pub const INTERNAL_FLUSHING: Self = Self {
        flushing: true,
        internal: true,
    };
}

/// Kind of a metadata item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetadataKind {
    /// End of stream.
    Eos(EosFlags),
    /// Data-flow gap marker.
    DataFlowGap,
    /// Any other client metadata, carried opaquely.
    Custom(u32),
}

/// How the last reference to a tracked EOS went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EosOutcome {
    /// At least one holder dropped it instead of rendering it.
    pub dropped: bool,
}

type DestroyFn = Box<dyn FnOnce(EosOutcome) + Send>;

struct EosRefState {
    refs: u32,
    any_dropped: bool,
    on_destroy: Option<DestroyFn>,
}

/// Reference-counted tracker shared by all copies of one EOS.
///
/// Dropping a `SharedEos` releases its reference as rendered; use
/// [`SharedEos::release`] to report a drop.
pub struct SharedEos {
    core: Option<Arc<Mutex<EosRefState>>>,
}

impl fmt::Debug for SharedEos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let refs = self.core.as_ref().map(|c| c.lock().refs);
        f.debug_struct("SharedEos").field("refs", &refs).finish()
    }
}

impl SharedEos {
    /// Creates a tracker holding one reference.
    pub fn new(on_destroy: impl FnOnce(EosOutcome) + Send + 'static) -> Self {
        Self {
            core: Some(Arc::new(Mutex::new(EosRefState {
                refs: 1,
                any_dropped: false,
                on_destroy: Some(Box::new(on_destroy)),
            }))),
        }
    }

    /// Takes another reference for a duplicate holder.
    pub fn add_ref(&self) -> Self {
        if let Some(core) = &self.core {
            core.lock().refs += 1;
        }
        Self {
            core: self.core.clone(),
        }
    }

    /// Current reference count.
    pub fn ref_count(&self) -> u32 {
        self.core.as_ref().map_or(0, |c| c.lock().refs)
    }

    /// Releases this reference. Runs the destroy callback when it was the
    /// last one.
    pub fn release(mut self, dropped: bool) {
        self.release_inner(dropped);
    }

    fn release_inner(&mut self, dropped: bool) {
        let Some(core) = self.core.take() else {
            return;
        };
        let fire = {
            let mut state = core.lock();
            state.refs = state.refs.saturating_sub(1);
            state.any_dropped |= dropped;
            if state.refs == 0 {
                state.on_destroy.take().map(|cb| (cb, state.any_dropped))
            } else {
                None
            }
        };
        if let Some((cb, any_dropped)) = fire {
            cb(EosOutcome {
                dropped: any_dropped,
            });
        }
    }
}

impl Drop for SharedEos {
    fn drop(&mut self) {
        self.release_inner(false);
    }
}

/// One metadata item.
#[derive(Debug)]
pub struct Metadata {
    /// What it is.
    pub kind: MetadataKind,
    /// Byte offset within the buffer it rides on.
    pub offset: u32,
    tracker: Option<SharedEos>,
}

impl Metadata {
    /// Untracked item.
    pub fn new(kind: MetadataKind, offset: u32) -> Self {
        Self {
            kind,
            offset,
            tracker: None,
        }
    }

    /// EOS at offset 0.
    pub fn eos(flags: EosFlags) -> Self {
        Self::new(MetadataKind::Eos(flags), 0)
    }

    /// Attaches a shared tracker.
    pub fn with_tracker(mut self, tracker: SharedEos) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Returns `true` for any EOS.
    #[inline]
    pub fn is_eos(&self) -> bool {
        matches!(self.kind, MetadataKind::Eos(_))
    }

    /// Returns `true` for a flushing EOS.
    #[inline]
    pub fn is_flushing_eos(&self) -> bool {
        matches!(self.kind, MetadataKind::Eos(f) if f.flushing)
    }

    /// Returns `true` if a tracker is attached.
    pub fn is_tracked(&self) -> bool {
        self.tracker.is_some()
    }

    /// Duplicate for a peer container, sharing the tracker.
    pub fn duplicate(&self) -> Self {
        Self {
            kind: self.kind,
            offset: self.offset,
            tracker: self.tracker.as_ref().map(SharedEos::add_ref),
        }
    }

    /// Destroys the item, releasing its tracker reference.
    pub fn destroy(self, dropped: bool) {
        if let Some(tracker) = self.tracker {
            tracker.release(dropped);
        }
    }
}

/// Destroys every item in `list`.
pub fn destroy_all(list: &mut Vec<Metadata>, dropped: bool) {
    for md in list.drain(..) {
        md.destroy(dropped);
    }
}
