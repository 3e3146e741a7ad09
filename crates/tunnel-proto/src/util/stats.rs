//! Counters for the events the data plane is expected to report.
//!
//! There is no sink here: each component owns a stats struct full of
//! [`Counter`]s, and whoever cares can call `snapshot()` on it.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing event counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Record one event.
    pub fn inc(&self) {
        self.add(1);
    }
    /// Record `n` events.
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
    /// Return the number of events so far.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Declare a struct of named [`Counter`]s with a `snapshot` method.
///
/// ```
/// tunnel_proto::define_stats! {
///     /// Things that happened to widgets.
///     pub struct WidgetStats {
///         /// Widgets made.
///         made,
///         /// Widgets lost.
///         lost,
///     }
/// }
/// let s = WidgetStats::default();
/// s.made.inc();
/// assert_eq!(s.snapshot(), vec![("made", 1), ("lost", 0)]);
/// ```
#[macro_export]
macro_rules! define_stats {
    {
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$fmeta:meta])* $field:ident ),* $(,)?
        }
    } => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $crate::Counter, )*
        }
        impl $name {
            /// Return the current value of every counter, by name.
            pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
                vec![ $( (stringify!($field), self.$field.get()), )* ]
            }
        }
    };
}

define_stats! {
    /// Counters kept by a [`ReassemblyEngine`](crate::reassembly::ReassemblyEngine).
    pub struct ReassemblyStats {
        /// Messages reassembled and delivered.
        completed,
        /// Messages abandoned after the reassembly timeout.
        failed,
        /// Cells dropped for a bad checksum or a malformed record.
        corrupt,
        /// Records that used the reserved delivery type.
        unknown_delivery_type,
    }
}

define_stats! {
    /// Counters kept by a [`BatchingEngine`](crate::batch::BatchingEngine).
    pub struct BatchStats {
        /// Cells sent because they were full.
        full_cells,
        /// Cells sent before they were full.
        partial_flushes,
        /// Times the engine asked to be called again later.
        delays_requested,
        /// Padding bytes sent in partially full cells.
        small_fragment_waste,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters() {
        let s = BatchStats::default();
        s.full_cells.inc();
        s.small_fragment_waste.add(40);
        s.small_fragment_waste.add(2);
        let snap = s.snapshot();
        assert_eq!(snap[0], ("full_cells", 1));
        assert_eq!(snap[3], ("small_fragment_waste", 42));
        assert_eq!(snap.len(), 4);
    }
}
