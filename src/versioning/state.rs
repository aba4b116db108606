//! Segment ownership state machine.
//!
//! ```text
//!  NOT_OWNED ──Register──▶ BLOCKED ──StartKeyTransfer──▶ KEY_TRANSFER
//!      │                      │                          │         │
//!      │ Own                  │ Cancel         KeysFound │         │ KeysEmpty
//!      ▼                      ▼                          ▼         ▼
//!    OWNED                NOT_OWNED           VALUE_TRANSFER     OWNED
//!                                                        │
//!                                         ValuesReceived ▼
//!                                                      OWNED
//!
//!  KEY_TRANSFER ──Cancel──▶ NOT_OWNED      any ──Unregister──▶ NOT_OWNED
//! ```
//!
//! Each segment's state lives in its own atomic cell; transitions are
//! applied with compare-and-swap against the table in [`SegmentState::on`].

use crate::error::{Error, Result};
use crate::types::SegmentId;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Ownership state of one segment on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegmentState {
    /// Another node owns the segment.
    NotOwned = 0,
    /// This node is the prospective owner; access waits for the key transfer.
    Blocked = 1,
    /// Keys are being pulled from previous owners.
    KeyTransfer = 2,
    /// All keys are known, some values still live on other nodes.
    ValueTransfer = 3,
    /// This node owns the segment.
    Owned = 4,
}

impl SegmentState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SegmentState::Blocked,
            2 => SegmentState::KeyTransfer,
            3 => SegmentState::ValueTransfer,
            4 => SegmentState::Owned,
            _ => SegmentState::NotOwned,
        }
    }

    /// Whether versions may be issued for the segment in this state.
    pub fn is_live_owner(self) -> bool {
        matches!(
            self,
            SegmentState::KeyTransfer | SegmentState::ValueTransfer | SegmentState::Owned
        )
    }

    /// One-character tag used in segment table dumps.
    pub fn single_char(self) -> char {
        match self {
            SegmentState::NotOwned => 'N',
            SegmentState::Blocked => 'B',
            SegmentState::KeyTransfer => 'K',
            SegmentState::ValueTransfer => 'V',
            SegmentState::Owned => 'O',
        }
    }

    /// Target state for `event`, or `None` if the transition is illegal.
    pub fn on(self, event: SegmentEvent) -> Option<SegmentState> {
        use SegmentEvent::*;
        use SegmentState::*;

        match (self, event) {
            (NotOwned, Register) => Some(Blocked),
            (NotOwned, Own) => Some(Owned),
            (NotOwned, Cancel) => Some(NotOwned),
            (Blocked, StartKeyTransfer) => Some(KeyTransfer),
            (Blocked, Cancel) => Some(NotOwned),
            (KeyTransfer, KeysFound) => Some(ValueTransfer),
            (KeyTransfer, KeysEmpty) => Some(Owned),
            (KeyTransfer, Cancel) => Some(NotOwned),
            (ValueTransfer, ValuesReceived) => Some(Owned),
            (_, Unregister) => Some(NotOwned),
            _ => None,
        }
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.single_char())
    }
}

/// Input of the segment state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentEvent {
    /// This node became the prospective owner.
    Register,
    /// Ownership without transfer (first topology or fetch disabled).
    Own,
    /// Every member confirmed it stopped serving stale reads.
    StartKeyTransfer,
    /// Key pull finished and some values are remote.
    KeysFound,
    /// Key pull finished and found nothing.
    KeysEmpty,
    /// Transfer failed or was superseded.
    Cancel,
    /// All values of the topology arrived.
    ValuesReceived,
    /// This node no longer owns the segment.
    Unregister,
}

/// Fixed-size table of per-segment atomic state cells.
#[derive(Debug)]
pub struct SegmentTable {
    cells: Vec<AtomicU8>,
}

impl SegmentTable {
    /// Create a table with every segment `NotOwned`.
    pub fn new(num_segments: u32) -> Self {
        Self {
            cells: (0..num_segments)
                .map(|_| AtomicU8::new(SegmentState::NotOwned as u8))
                .collect(),
        }
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the table has no segments.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Current state of a segment; out-of-range segments are `NotOwned`.
    pub fn get(&self, segment: SegmentId) -> SegmentState {
        self.cells
            .get(segment as usize)
            .map(|c| SegmentState::from_u8(c.load(Ordering::Acquire)))
            .unwrap_or(SegmentState::NotOwned)
    }

    /// Apply `event`, returning the previous and the new state.
    pub fn fire(
        &self,
        segment: SegmentId,
        event: SegmentEvent,
    ) -> Result<(SegmentState, SegmentState)> {
        let cell = self.cells.get(segment as usize).ok_or_else(|| {
            Error::Config(format!(
                "segment {} out of range 0..{}",
                segment,
                self.cells.len()
            ))
        })?;

        let mut current = cell.load(Ordering::Acquire);
        loop {
            let state = SegmentState::from_u8(current);
            let next = state.on(event).ok_or(Error::IllegalTransition {
                segment,
                state,
                event,
            })?;
            match cell.compare_exchange(current, next as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok((state, next)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Apply `event` only if the segment is currently in `expected`.
    pub fn fire_if(
        &self,
        segment: SegmentId,
        expected: SegmentState,
        event: SegmentEvent,
    ) -> Result<bool> {
        let Some(next) = expected.on(event) else {
            return Err(Error::IllegalTransition {
                segment,
                state: expected,
                event,
            });
        };
        let Some(cell) = self.cells.get(segment as usize) else {
            return Ok(false);
        };
        Ok(cell
            .compare_exchange(
                expected as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok())
    }

    /// Segments currently in `state`.
    pub fn segments_in(&self, state: SegmentState) -> Vec<SegmentId> {
        (0..self.cells.len() as SegmentId)
            .filter(|s| self.get(*s) == state)
            .collect()
    }

    /// Render the table, sixteen segments per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, _) in self.cells.iter().enumerate() {
            if i % 16 == 0 {
                out.push('\n');
            }
            out.push_str(&format!("{:4}={} ", i, self.get(i as SegmentId)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [SegmentState; 5] = [
        SegmentState::NotOwned,
        SegmentState::Blocked,
        SegmentState::KeyTransfer,
        SegmentState::ValueTransfer,
        SegmentState::Owned,
    ];

    #[test]
    fn test_transition_table() {
        use SegmentEvent::*;
        use SegmentState::*;

        assert_eq!(NotOwned.on(Register), Some(Blocked));
        assert_eq!(Blocked.on(StartKeyTransfer), Some(KeyTransfer));
        assert_eq!(KeyTransfer.on(KeysFound), Some(ValueTransfer));
        assert_eq!(KeyTransfer.on(KeysEmpty), Some(Owned));
        assert_eq!(KeyTransfer.on(Cancel), Some(NotOwned));
        assert_eq!(ValueTransfer.on(ValuesReceived), Some(Owned));

        for state in ALL_STATES {
            assert_eq!(state.on(Unregister), Some(NotOwned));
        }

        assert_eq!(NotOwned.on(StartKeyTransfer), None);
        assert_eq!(Owned.on(Register), None);
        assert_eq!(ValueTransfer.on(Cancel), None);
        assert_eq!(Blocked.on(KeysFound), None);
        assert_eq!(Owned.on(ValuesReceived), None);
    }

    #[test]
    fn test_only_live_owners_issue_versions() {
        let live: Vec<_> = ALL_STATES.iter().filter(|s| s.is_live_owner()).collect();
        assert_eq!(
            live,
            vec![
                &SegmentState::KeyTransfer,
                &SegmentState::ValueTransfer,
                &SegmentState::Owned
            ]
        );
    }

    #[test]
    fn test_fire_rejects_illegal_event() {
        let table = SegmentTable::new(4);
        let err = table.fire(2, SegmentEvent::StartKeyTransfer).unwrap_err();
        assert!(matches!(
            err,
            Error::IllegalTransition {
                segment: 2,
                state: SegmentState::NotOwned,
                ..
            }
        ));
        assert_eq!(table.get(2), SegmentState::NotOwned);

        assert_eq!(
            table.fire(2, SegmentEvent::Register).unwrap(),
            (SegmentState::NotOwned, SegmentState::Blocked)
        );
        assert!(!table
            .fire_if(2, SegmentState::KeyTransfer, SegmentEvent::KeysEmpty)
            .unwrap());
        assert!(table.fire(9, SegmentEvent::Register).is_err());
    }

    #[test]
    fn test_render() {
        let table = SegmentTable::new(20);
        table.fire(1, SegmentEvent::Own).unwrap();
        table.fire(17, SegmentEvent::Register).unwrap();

        let rendered = table.render();
        assert_eq!(rendered.lines().filter(|l| !l.is_empty()).count(), 2);
        assert!(rendered.contains("   1=O"));
        assert!(rendered.contains("  17=B"));
        assert_eq!(table.segments_in(SegmentState::Owned), vec![1]);
    }
}
