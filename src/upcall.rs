// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dataplane-to-control-plane upcall events (spec.md §4.3, §6 "IPC
//! surface"). Each upcall carries a per-channel generation number assigned
//! by the dataplane; the control plane uses it to detect upcalls delivered
//! out of order or more than once across the IPC boundary, and to notice
//! when one was dropped entirely.

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpcallKind {
    PrimaryInactive,
    FecUpdate,
    NcsiReady,
    BurstDone,
    FastFillDone,
    Abort,
    SourceTableChanged,
}

/// The "optional payload" spec.md §6 mentions upcall events may carry.
/// Only `BurstDone` has one modelled here: the NCSI data the dataplane
/// reports at the end of an RCC burst.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpcallPayload {
    Ncsi {
        first_mcast_seq_number: u16,
        first_mcast_recv_time_msec: u32,
    },
}

#[derive(Copy, Clone, Debug)]
pub struct UpcallEvent {
    pub kind: UpcallKind,
    pub generation: u32,
    pub payload: Option<UpcallPayload>,
}

impl UpcallEvent {
    pub fn new(kind: UpcallKind, generation: u32) -> Self {
        Self { kind, generation, payload: None }
    }

    pub fn with_payload(kind: UpcallKind, generation: u32, payload: UpcallPayload) -> Self {
        Self { kind, generation, payload: Some(payload) }
    }
}

/// Tracks the last-seen generation number per channel and classifies each
/// newly-arrived upcall against it (spec.md §7 "Upcall generation
/// checking").
#[derive(Default)]
pub struct GenerationTracker {
    last_seen: Option<u32>,
    out_of_order: u64,
    repeated: u64,
    lost: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Exactly the expected next generation; deliver normally.
    InOrder,
    /// Strictly less than or equal to one already observed; a duplicate
    /// delivery across the IPC boundary. Dropped, not delivered twice.
    Repeated,
    /// Strictly greater than `last_seen + 1`: one or more upcalls were
    /// lost. Delivered anyway (the event itself still matters), but the
    /// gap is counted.
    Lost { missed: u32 },
}

impl GenerationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&mut self, generation: u32) -> GenerationOutcome {
        let outcome = match self.last_seen {
            None => GenerationOutcome::InOrder,
            Some(last) if generation <= last => GenerationOutcome::Repeated,
            Some(last) if generation == last + 1 => GenerationOutcome::InOrder,
            Some(last) => GenerationOutcome::Lost {
                missed: generation - last - 1,
            },
        };
        match outcome {
            GenerationOutcome::Repeated => self.repeated += 1,
            GenerationOutcome::Lost { missed } => {
                self.lost += u64::from(missed);
                self.last_seen = Some(generation);
            }
            GenerationOutcome::InOrder => self.last_seen = Some(generation),
        }
        if matches!(outcome, GenerationOutcome::Lost { .. }) {
            self.out_of_order += 1;
        }
        outcome
    }

    pub fn counters(&self) -> (u64, u64, u64) {
        (self.out_of_order, self.repeated, self.lost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_upcall_is_always_in_order() {
        let mut t = GenerationTracker::new();
        assert_eq!(t.classify(5), GenerationOutcome::InOrder);
    }

    #[test]
    fn sequential_generations_stay_in_order() {
        let mut t = GenerationTracker::new();
        assert_eq!(t.classify(0), GenerationOutcome::InOrder);
        assert_eq!(t.classify(1), GenerationOutcome::InOrder);
        assert_eq!(t.classify(2), GenerationOutcome::InOrder);
    }

    #[test]
    fn repeat_generation_is_flagged_and_not_advanced() {
        let mut t = GenerationTracker::new();
        t.classify(3);
        assert_eq!(t.classify(3), GenerationOutcome::Repeated);
        assert_eq!(t.classify(2), GenerationOutcome::Repeated);
        let (_, repeated, _) = t.counters();
        assert_eq!(repeated, 2);
    }

    #[test]
    fn gap_in_generations_is_counted_as_lost() {
        let mut t = GenerationTracker::new();
        t.classify(0);
        let outcome = t.classify(4);
        assert_eq!(outcome, GenerationOutcome::Lost { missed: 3 });
        let (out_of_order, _, lost) = t.counters();
        assert_eq!(out_of_order, 1);
        assert_eq!(lost, 3);
    }
}
