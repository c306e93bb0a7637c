use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::fmt;

use super::Side;

type Predicate = Box<dyn FnMut(Side, &[u8]) -> bool>;

/// A fault injector that drops frames on their way across a link.
///
/// Frames are numbered from 0, separately for each side they are sent from. A frame
/// is dropped if its number was chosen with [drop_nth](#method.drop_nth), or if any
/// predicate registered with [drop_if](#method.drop_if) returns `true` for it.
#[derive(Default)]
pub struct FaultInjector {
    counters: [u64; 2],
    indices: BTreeSet<(Side, u64)>,
    predicates: Vec<Predicate>,
    dropped: u64,
}

impl fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FaultInjector")
            .field("counters", &self.counters)
            .field("indices", &self.indices)
            .field("predicates", &self.predicates.len())
            .field("dropped", &self.dropped)
            .finish()
    }
}

impl FaultInjector {
    /// Create a fault injector that drops nothing.
    pub fn new() -> FaultInjector {
        FaultInjector::default()
    }

    /// Drop the frame numbered `index` among those sent from `side`.
    pub fn drop_nth(&mut self, side: Side, index: u64) {
        self.indices.insert((side, index));
    }

    /// Drop every frame for which `predicate` returns `true`.
    ///
    /// The predicate sees the side a frame was sent from and its octets. It may keep
    /// state, for instance to drop only the first match.
    pub fn drop_if<F>(&mut self, predicate: F)
    where
        F: FnMut(Side, &[u8]) -> bool + 'static,
    {
        self.predicates.push(Box::new(predicate));
    }

    /// Forget every rule. Frame numbering carries on.
    pub fn clear(&mut self) {
        self.indices.clear();
        self.predicates.clear();
    }

    /// Number of frames dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Number of frames seen so far from `side`, dropped or not.
    pub fn seen(&self, side: Side) -> u64 {
        self.counters[side.index()]
    }

    /// Decide the fate of the next frame sent from `side`.
    pub(crate) fn should_drop(&mut self, side: Side, frame: &[u8]) -> bool {
        let index = self.counters[side.index()];
        self.counters[side.index()] += 1;

        let mut drop = self.indices.remove(&(side, index));
        // Every predicate sees every frame, so stateful ones stay in step.
        for predicate in self.predicates.iter_mut() {
            drop |= predicate(side, frame);
        }
        if drop {
            self.dropped += 1;
            net_debug!("phy: dropping frame #{} from {} ({} octets)", index, side, frame.len());
        }
        drop
    }
}
