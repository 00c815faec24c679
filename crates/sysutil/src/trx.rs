//! Reentrant traversal markers ("transaction colors").
//!
//! One [`TrxState`] manages the marker system for a whole data structure;
//! every element carries a [`TrxLabel`]; every traversal holds a [`Trx`].
//! A traversal gets a color bit from [`TrxState::begin`] and may visit each
//! label at most once; the transaction id only advances once every color
//! handed out has been returned through [`TrxState::end`], so concurrent and
//! nested traversals within the same transaction stay independent.

/// Transaction id type.
pub type TrxId = u64;

/// Global transaction state, one per managed data structure.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrxState {
    /// Id of the currently executing transaction.
    id: TrxId,
    /// Traversal colors handed out in this transaction.
    cl: TrxId,
    /// Traversal colors that have finished in this transaction.
    ex: TrxId,
}

/// Per-element marker state.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrxLabel {
    id: TrxId,
    cl: TrxId,
}

/// The handle of one ongoing traversal.
#[derive(Debug, Clone, Copy)]
pub struct Trx {
    id: TrxId,
    cl: TrxId,
}

impl TrxState {
    /// Creates a fresh state with no traversal running.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new traversal.
    ///
    /// Picks the next unused color of the current transaction. Returns `None`
    /// when every usable color bit is taken.
    pub fn begin(&mut self) -> Option<Trx> {
        let cl = (1 as TrxId) << self.cl.count_ones();

        if cl == (1 as TrxId) << (TrxId::BITS - 1) {
            return None;
        }

        self.cl |= cl;

        Some(Trx { id: self.id, cl })
    }

    /// Ends a traversal.
    ///
    /// When the last outstanding color finishes, the transaction id advances
    /// and all colors become available again.
    pub fn end(&mut self, trx: Trx) {
        self.ex |= trx.cl;

        if self.ex == self.cl {
            self.id += 1;
            self.cl = 0;
            self.ex = 0;
        }
    }

    /// Tests whether the transaction has finished, i.e. no traversal holds a
    /// color.
    #[inline]
    pub fn fin(&self) -> bool {
        self.cl == 0
    }

    /// Stamps the current transaction id onto `label` without claiming a
    /// visit.
    pub fn sync(&self, label: &mut TrxLabel) {
        label.id = self.id;
        label.cl = 0;
    }

    /// Distance between the current transaction id and the label's last
    /// stamp.
    #[inline]
    pub fn label_age(&self, label: &TrxLabel) -> i64 {
        self.id.wrapping_sub(label.id) as i64
    }
}

impl Trx {
    /// Attempts to visit `label`.
    ///
    /// Returns `true` exactly once per color per label: the first caller of a
    /// given color claims the visit, repeat calls see their color already
    /// recorded and are refused.
    pub fn visit(&self, label: &mut TrxLabel) -> bool {
        if self.id != label.id {
            label.id = self.id;
            label.cl = self.cl;

            true
        } else if self.cl & label.cl == 0 {
            label.cl |= self.cl;

            true
        } else {
            false
        }
    }

    /// Tests whether this traversal has already visited `label`.
    pub fn has_visited(&self, label: &TrxLabel) -> bool {
        self.id == label.id && self.cl & label.cl != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visit_at_most_once() {
        let mut state = TrxState::new();
        let mut label = TrxLabel::default();

        let trx = state.begin().unwrap();
        assert!(trx.visit(&mut label));
        assert!(!trx.visit(&mut label));
        assert!(!trx.visit(&mut label));
        assert!(trx.has_visited(&label));
        state.end(trx);
    }

    #[test]
    fn test_second_color_can_revisit() {
        let mut state = TrxState::new();
        let mut label = TrxLabel::default();

        let a = state.begin().unwrap();
        assert!(a.visit(&mut label));

        // A concurrent traversal in the same transaction has its own color.
        let b = state.begin().unwrap();
        assert!(b.visit(&mut label));
        assert!(!b.visit(&mut label));

        state.end(a);
        assert!(!state.fin());
        state.end(b);
        assert!(state.fin());
    }

    #[test]
    fn test_new_transaction_resets_labels() {
        let mut state = TrxState::new();
        let mut label = TrxLabel::default();

        let a = state.begin().unwrap();
        assert!(a.visit(&mut label));
        state.end(a);

        // All colors returned, so the id advanced and the label is stale.
        let b = state.begin().unwrap();
        assert!(b.visit(&mut label));
        state.end(b);
    }

    #[test]
    fn test_colors_exhaust() {
        let mut state = TrxState::new();

        let mut held = Vec::new();
        for _ in 0..TrxId::BITS - 1 {
            held.push(state.begin().expect("color available"));
        }
        assert!(state.begin().is_none());

        for trx in held {
            state.end(trx);
        }
        assert!(state.fin());
        assert!(state.begin().is_some());
    }

    #[test]
    fn test_label_age() {
        let mut state = TrxState::new();
        let mut label = TrxLabel::default();

        let a = state.begin().unwrap();
        a.visit(&mut label);
        state.end(a);

        assert_eq!(state.label_age(&label), 1);

        let b = state.begin().unwrap();
        state.end(b);
        assert_eq!(state.label_age(&label), 2);
    }
}
