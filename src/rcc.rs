// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Rapid-Channel-Change state machine (spec.md §4.4).
//!
//! Events delivered to the FSM from within an action routine are
//! strictly FIFO-serialised through a depth-4 queue and fully drained
//! before the outermost [`Fsm::deliver_event`] call returns (spec.md §5).
//! Unexpected `(state, event)` pairs are logged and ignored, never panic.

use std::time::Instant;

use crate::time::WallTime;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Init,
    WaitApp,
    FinSuccess,
    Abort,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    RapidChannelChange,
    SlowChannelChange,
    NatBindingComplete,
    ReceiveValidApp,
    ReceiveInvalidApp,
    ReceiveNullApp,
    RccStartTimeout,
    RccIpcErr,
    RccInternalErr,
    ChanDeinit,
}

/// `fail_reason` query values (spec.md §4.4 "Failure classification").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailReason {
    None,
    RccDisabled,
    InvalidApp,
    NullApp,
    AppTimeout,
    NatTimeout,
    IpcError,
    ChanDeinit,
    Unknown,
}

impl FailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailReason::None => "NONE",
            FailReason::RccDisabled => "RCC_DISABLED",
            FailReason::InvalidApp => "INVALID_APP",
            FailReason::NullApp => "NULL_APP",
            FailReason::AppTimeout => "APP_TIMEOUT",
            FailReason::NatTimeout => "NAT_TIMEOUT",
            FailReason::IpcError => "IPC_ERROR",
            FailReason::ChanDeinit => "CHAN_DEINIT",
            FailReason::Unknown => "UNKNOWN",
        }
    }
}

/// `(event_kind, state, event, timestamp)`, held in a ring buffer of 16
/// entries per channel (spec.md §3 "RCC log entry").
#[derive(Copy, Clone, Debug)]
pub struct LogEntry {
    pub kind: LogEntryKind,
    pub state: State,
    pub event: Option<Event>,
    pub timestamp: WallTime,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogEntryKind {
    StateEvent,
    StateEnter,
    StateExit,
}

const LOG_CAPACITY: usize = 16;
const QUEUE_DEPTH: usize = 4;

struct LogRing {
    entries: [Option<LogEntry>; LOG_CAPACITY],
    next: usize,
}

impl LogRing {
    fn new() -> Self {
        Self {
            entries: [None; LOG_CAPACITY],
            next: 0,
        }
    }

    fn push(&mut self, entry: LogEntry) {
        self.entries[self.next] = Some(entry);
        self.next = (self.next + 1) % LOG_CAPACITY;
    }

    fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter_map(|e| e.as_ref())
    }
}

/// Hooks the FSM's action routines invoke; implemented by the owning
/// [`crate::channel::Channel`]. Kept as a trait so `rcc` has no dependency
/// on `channel`, avoiding the module cycle spec.md §9 warns a naive
/// pointer-based port would create.
pub trait RccHooks {
    /// Sends the RTCP compound containing PSFB-PLI + `PLII` APP on the
    /// primary session (spec.md §4.4 "PLI-NAK payload").
    fn send_pli_nak(&mut self);

    /// `rcc_abort_notify`: enable ER immediately, tell the dataplane to
    /// abort the burst, and cancel any pending repair-session send-report
    /// timer (spec.md §4.4 and `SPEC_FULL.md` §3).
    fn rcc_abort_notify(&mut self);
}

/// The per-channel RCC state machine.
pub struct Fsm {
    state: State,
    log: LogRing,
    queue: [Option<Event>; QUEUE_DEPTH],
    queue_len: usize,
    delivering: bool,
    rcc_enabled: bool,
    pli_nak_sent: bool,
    nakpli_sent_time: Option<Instant>,
    app_received_time: Option<Instant>,
    event_cause: Option<Event>,
}

impl Fsm {
    pub fn new(rcc_enabled: bool) -> Self {
        Self {
            state: State::Init,
            log: LogRing::new(),
            queue: [None; QUEUE_DEPTH],
            queue_len: 0,
            delivering: false,
            rcc_enabled,
            pli_nak_sent: false,
            nakpli_sent_time: None,
            app_received_time: None,
            event_cause: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.log.iter().copied().collect()
    }

    pub fn nakpli_sent_time(&self) -> Option<Instant> {
        self.nakpli_sent_time
    }

    /// Delivers `event` to the FSM, running `hooks`' action routines as
    /// transitions demand. If this call is made re-entrantly from within
    /// an action routine (i.e. `delivering` is already true), the event is
    /// queued (capacity 4) instead of processed immediately; the outermost
    /// call drains the queue before returning.
    pub fn deliver_event(&mut self, event: Event, hooks: &mut impl RccHooks) {
        if self.delivering {
            if self.queue_len < QUEUE_DEPTH {
                self.queue[self.queue_len] = Some(event);
                self.queue_len += 1;
            } else {
                log::warn!("RCC event queue overflow, dropping {:?}", event);
            }
            return;
        }
        self.delivering = true;
        self.process(event, hooks);
        while self.queue_len > 0 {
            let next = self.queue[0].take().expect("queue_len tracks occupied slots");
            self.queue.copy_within(1.., 0);
            self.queue[QUEUE_DEPTH - 1] = None;
            self.queue_len -= 1;
            self.process(next, hooks);
        }
        self.delivering = false;
    }

    fn log_event(&mut self, event: Event) {
        self.log.push(LogEntry {
            kind: LogEntryKind::StateEvent,
            state: self.state,
            event: Some(event),
            timestamp: WallTime::now(),
        });
    }

    fn transition(&mut self, next: State) {
        self.log.push(LogEntry {
            kind: LogEntryKind::StateExit,
            state: self.state,
            event: None,
            timestamp: WallTime::now(),
        });
        self.state = next;
        self.log.push(LogEntry {
            kind: LogEntryKind::StateEnter,
            state: self.state,
            event: None,
            timestamp: WallTime::now(),
        });
    }

    fn process(&mut self, event: Event, hooks: &mut impl RccHooks) {
        self.log_event(event);
        use Event::*;
        use State::*;
        match (self.state, event) {
            (Init, RapidChannelChange) => {
                self.transition(WaitApp);
            }
            (Init, SlowChannelChange) => {
                self.transition(FinSuccess);
            }
            (WaitApp, NatBindingComplete) => {
                hooks.send_pli_nak();
                self.pli_nak_sent = true;
                self.nakpli_sent_time = Some(Instant::now());
                // stays in WaitApp
            }
            (WaitApp, ReceiveValidApp) => {
                self.app_received_time = Some(Instant::now());
                self.transition(FinSuccess);
            }
            (WaitApp, ReceiveInvalidApp)
            | (WaitApp, ReceiveNullApp)
            | (WaitApp, RccStartTimeout)
            | (WaitApp, RccIpcErr)
            | (WaitApp, RccInternalErr)
            | (WaitApp, ChanDeinit) => {
                self.event_cause = Some(event);
                hooks.rcc_abort_notify();
                self.transition(Abort);
            }
            (FinSuccess, _) | (Abort, _) => {
                // terminal states: ignore.
            }
            (Init, _) | (WaitApp, _) => {
                log::warn!("UNEXPECTED_EVENT state={:?} event={:?}", self.state, event);
            }
        }
    }

    /// `fail_reason` (spec.md §4.4 "Failure classification").
    pub fn fail_reason(&self) -> FailReason {
        if !self.rcc_enabled {
            return FailReason::RccDisabled;
        }
        if self.state != State::Abort {
            return FailReason::None;
        }
        match self.event_cause {
            Some(Event::ReceiveInvalidApp) => FailReason::InvalidApp,
            Some(Event::ReceiveNullApp) => FailReason::NullApp,
            Some(Event::RccStartTimeout) => {
                if self.pli_nak_sent {
                    FailReason::AppTimeout
                } else {
                    FailReason::NatTimeout
                }
            }
            Some(Event::RccIpcErr) => FailReason::IpcError,
            Some(Event::ChanDeinit) => FailReason::ChanDeinit,
            _ => FailReason::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingHooks {
        pli_naks_sent: u32,
        aborts: u32,
    }

    impl RccHooks for RecordingHooks {
        fn send_pli_nak(&mut self) {
            self.pli_naks_sent += 1;
        }
        fn rcc_abort_notify(&mut self) {
            self.aborts += 1;
        }
    }

    #[test]
    fn scenario_1_happy_path_rcc() {
        let mut fsm = Fsm::new(true);
        let mut hooks = RecordingHooks { pli_naks_sent: 0, aborts: 0 };
        fsm.deliver_event(Event::RapidChannelChange, &mut hooks);
        assert_eq!(fsm.state(), State::WaitApp);
        fsm.deliver_event(Event::NatBindingComplete, &mut hooks);
        assert_eq!(hooks.pli_naks_sent, 1);
        assert_eq!(fsm.state(), State::WaitApp);
        fsm.deliver_event(Event::ReceiveValidApp, &mut hooks);
        assert_eq!(fsm.state(), State::FinSuccess);
        assert_eq!(fsm.fail_reason().as_str(), "NONE");
    }

    #[test]
    fn reachable_states_are_exactly_the_four_named() {
        let mut fsm = Fsm::new(true);
        let mut hooks = RecordingHooks { pli_naks_sent: 0, aborts: 0 };
        fsm.deliver_event(Event::RapidChannelChange, &mut hooks);
        fsm.deliver_event(Event::RccInternalErr, &mut hooks);
        assert_eq!(fsm.state(), State::Abort);
        assert_eq!(hooks.aborts, 1);
        // Abort is terminal: further events are ignored.
        fsm.deliver_event(Event::ReceiveValidApp, &mut hooks);
        assert_eq!(fsm.state(), State::Abort);
    }

    #[test]
    fn fail_reason_disambiguates_app_vs_nat_timeout() {
        let mut fsm = Fsm::new(true);
        let mut hooks = RecordingHooks { pli_naks_sent: 0, aborts: 0 };
        fsm.deliver_event(Event::RapidChannelChange, &mut hooks);
        // Timeout before any PLI-NAK was sent => NAT_TIMEOUT.
        fsm.deliver_event(Event::RccStartTimeout, &mut hooks);
        assert_eq!(fsm.fail_reason().as_str(), "NAT_TIMEOUT");
    }

    #[test]
    fn fail_reason_app_timeout_after_pli_nak_sent() {
        let mut fsm = Fsm::new(true);
        let mut hooks = RecordingHooks { pli_naks_sent: 0, aborts: 0 };
        fsm.deliver_event(Event::RapidChannelChange, &mut hooks);
        fsm.deliver_event(Event::NatBindingComplete, &mut hooks);
        fsm.deliver_event(Event::RccStartTimeout, &mut hooks);
        assert_eq!(fsm.fail_reason().as_str(), "APP_TIMEOUT");
    }

    #[test]
    fn rcc_disabled_short_circuits_to_fin_success() {
        let mut fsm = Fsm::new(false);
        let mut hooks = RecordingHooks { pli_naks_sent: 0, aborts: 0 };
        fsm.deliver_event(Event::SlowChannelChange, &mut hooks);
        assert_eq!(fsm.state(), State::FinSuccess);
        assert_eq!(fsm.fail_reason().as_str(), "RCC_DISABLED");
    }

    #[test]
    fn unexpected_event_is_logged_not_fatal() {
        let mut fsm = Fsm::new(true);
        let mut hooks = RecordingHooks { pli_naks_sent: 0, aborts: 0 };
        // NatBindingComplete in Init is unexpected; must not panic.
        fsm.deliver_event(Event::NatBindingComplete, &mut hooks);
        assert_eq!(fsm.state(), State::Init);
    }

    #[test]
    fn log_ring_caps_at_sixteen_entries() {
        let mut fsm = Fsm::new(true);
        let mut hooks = RecordingHooks { pli_naks_sent: 0, aborts: 0 };
        fsm.deliver_event(Event::RapidChannelChange, &mut hooks);
        for _ in 0..20 {
            fsm.deliver_event(Event::NatBindingComplete, &mut hooks);
        }
        assert_eq!(fsm.log_entries().len(), LOG_CAPACITY);
    }
}
