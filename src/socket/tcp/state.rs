//! The connection state table.
//!
//! Every `(State, Event)` pair maps to exactly one `(State, Action)` pair. The
//! table is a plain `match`, so the compiler checks that it is total.

use core::fmt;

/// The state of a TCP socket, according to [RFC 793].
///
/// [RFC 793]: https://tools.ietf.org/html/rfc793
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
}

impl State {
    pub(crate) const ALL: [State; 11] = [
        State::Closed,
        State::Listen,
        State::SynSent,
        State::SynReceived,
        State::Established,
        State::CloseWait,
        State::LastAck,
        State::FinWait1,
        State::FinWait2,
        State::Closing,
        State::TimeWait,
    ];
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            State::Closed => write!(f, "CLOSED"),
            State::Listen => write!(f, "LISTEN"),
            State::SynSent => write!(f, "SYN-SENT"),
            State::SynReceived => write!(f, "SYN-RECEIVED"),
            State::Established => write!(f, "ESTABLISHED"),
            State::CloseWait => write!(f, "CLOSE-WAIT"),
            State::LastAck => write!(f, "LAST-ACK"),
            State::FinWait1 => write!(f, "FIN-WAIT-1"),
            State::FinWait2 => write!(f, "FIN-WAIT-2"),
            State::Closing => write!(f, "CLOSING"),
            State::TimeWait => write!(f, "TIME-WAIT"),
        }
    }
}

/// Something that happened to a connection: an application request, a timeout,
/// or the arrival of a segment classified by its control bits.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Event {
    AppListen,
    AppConnect,
    AppSend,
    SeqRecv,
    AppClose,
    Timeout,
    AckRx,
    SynRx,
    SynAckRx,
    FinRx,
    FinAckRx,
    RstRx,
    BadFlags,
}

impl Event {
    pub(crate) const ALL: [Event; 13] = [
        Event::AppListen,
        Event::AppConnect,
        Event::AppSend,
        Event::SeqRecv,
        Event::AppClose,
        Event::Timeout,
        Event::AckRx,
        Event::SynRx,
        Event::SynAckRx,
        Event::FinRx,
        Event::FinAckRx,
        Event::RstRx,
        Event::BadFlags,
    ];

    /// Classify the six control bits of a segment.
    ///
    /// PSH and URG are ignored. A segment carrying more than one of FIN, SYN and
    /// RST is malformed, as is anything that does not fit in six bits.
    pub fn from_flags(bits: u8) -> Event {
        const FIN: u8 = 0x01;
        const SYN: u8 = 0x02;
        const RST: u8 = 0x04;
        const ACK: u8 = 0x10;

        if bits >= 0x40 {
            return Event::BadFlags;
        }
        let ack = bits & ACK != 0;
        match bits & (FIN | SYN | RST) {
            0 if ack => Event::AckRx,
            0 => Event::SeqRecv,
            FIN if ack => Event::FinAckRx,
            FIN => Event::FinRx,
            SYN if ack => Event::SynAckRx,
            SYN => Event::SynRx,
            RST => Event::RstRx,
            _ => Event::BadFlags,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            Event::AppListen => "APP_LISTEN",
            Event::AppConnect => "APP_CONNECT",
            Event::AppSend => "APP_SEND",
            Event::SeqRecv => "SEQ_RECV",
            Event::AppClose => "APP_CLOSE",
            Event::Timeout => "TIMEOUT",
            Event::AckRx => "ACK_RX",
            Event::SynRx => "SYN_RX",
            Event::SynAckRx => "SYN_ACK_RX",
            Event::FinRx => "FIN_RX",
            Event::FinAckRx => "FIN_ACK_RX",
            Event::RstRx => "RST_RX",
            Event::BadFlags => "BAD_FLAGS",
        };
        write!(f, "{name}")
    }
}

/// What the connection has to do after a transition.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Action {
    NoAct,
    AckTx,
    AckTx1,
    RstTx,
    SynTx,
    SynAckTx,
    FinTx,
    FinAckTx,
    NewAck,
    NewSeqRx,
    Retx,
    TxData,
    PeerClose,
    AppClosed,
    CancelTimer,
    AppNotify,
    ServNotify,
}

impl Action {
    /// Whether carrying out this action needs the segment that caused it.
    pub fn needs_segment(&self) -> bool {
        matches!(
            self,
            Action::AckTx1
                | Action::NewAck
                | Action::NewSeqRx
                | Action::PeerClose
                | Action::ServNotify
        )
    }
}

/// Look up the transition for `event` in `state`.
pub fn transition(state: State, event: Event) -> (State, Action) {
    use Action as A;
    use Event as E;
    use State as S;

    match state {
        S::Closed => match event {
            E::AppListen => (S::Listen, A::NoAct),
            E::AppConnect => (S::SynSent, A::SynTx),
            E::AppSend => (S::Closed, A::RstTx),
            E::SeqRecv => (S::Closed, A::NoAct),
            E::AppClose => (S::Closed, A::NoAct),
            E::Timeout => (S::Closed, A::RstTx),
            E::AckRx => (S::Closed, A::RstTx),
            E::SynRx => (S::Closed, A::RstTx),
            E::SynAckRx => (S::Closed, A::RstTx),
            E::FinRx => (S::Closed, A::RstTx),
            E::FinAckRx => (S::Closed, A::RstTx),
            E::RstRx => (S::Closed, A::CancelTimer),
            E::BadFlags => (S::Closed, A::RstTx),
        },
        S::Listen => match event {
            E::AppListen => (S::Listen, A::NoAct),
            E::AppConnect => (S::SynSent, A::SynTx),
            E::AppSend => (S::SynSent, A::SynTx),
            E::SeqRecv => (S::Listen, A::NoAct),
            E::AppClose => (S::Closed, A::NoAct),
            E::Timeout => (S::Listen, A::NoAct),
            E::AckRx => (S::Listen, A::NoAct),
            // The listener stays put; the SYN is handed to a forked connection.
            E::SynRx => (S::Listen, A::SynAckTx),
            E::SynAckRx => (S::Listen, A::NoAct),
            E::FinRx => (S::Listen, A::NoAct),
            E::FinAckRx => (S::Listen, A::NoAct),
            E::RstRx => (S::Listen, A::NoAct),
            E::BadFlags => (S::Listen, A::NoAct),
        },
        S::SynSent => match event {
            E::AppListen => (S::Closed, A::RstTx),
            E::AppConnect => (S::SynSent, A::SynTx),
            E::AppSend => (S::SynSent, A::NoAct),
            E::SeqRecv => (S::Established, A::NewSeqRx),
            E::AppClose => (S::Closed, A::RstTx),
            E::Timeout => (S::Closed, A::NoAct),
            E::AckRx => (S::SynSent, A::NoAct),
            E::SynRx => (S::SynReceived, A::SynAckTx),
            E::SynAckRx => (S::Established, A::AckTx1),
            E::FinRx => (S::Closed, A::RstTx),
            E::FinAckRx => (S::Closed, A::RstTx),
            E::RstRx => (S::Closed, A::AppNotify),
            E::BadFlags => (S::Closed, A::RstTx),
        },
        S::SynReceived => match event {
            E::AppListen => (S::Closed, A::RstTx),
            E::AppConnect => (S::Closed, A::RstTx),
            E::AppSend => (S::Closed, A::RstTx),
            E::SeqRecv => (S::Established, A::NewSeqRx),
            E::AppClose => (S::FinWait1, A::FinTx),
            E::Timeout => (S::Closed, A::RstTx),
            E::AckRx => (S::Established, A::ServNotify),
            E::SynRx => (S::SynReceived, A::SynAckTx),
            E::SynAckRx => (S::Closed, A::RstTx),
            E::FinRx => (S::Closed, A::RstTx),
            E::FinAckRx => (S::CloseWait, A::PeerClose),
            E::RstRx => (S::Closed, A::CancelTimer),
            E::BadFlags => (S::Closed, A::RstTx),
        },
        S::Established => match event {
            E::AppListen => (S::Closed, A::RstTx),
            E::AppConnect => (S::Closed, A::RstTx),
            E::AppSend => (S::Established, A::TxData),
            E::SeqRecv => (S::Established, A::NewSeqRx),
            E::AppClose => (S::FinWait1, A::FinTx),
            E::Timeout => (S::Established, A::Retx),
            E::AckRx => (S::Established, A::NewAck),
            E::SynRx => (S::SynReceived, A::SynAckTx),
            E::SynAckRx => (S::Established, A::NoAct),
            E::FinRx => (S::CloseWait, A::PeerClose),
            E::FinAckRx => (S::CloseWait, A::PeerClose),
            E::RstRx => (S::Closed, A::CancelTimer),
            E::BadFlags => (S::Closed, A::RstTx),
        },
        S::CloseWait => match event {
            E::AppListen => (S::Closed, A::RstTx),
            E::AppConnect => (S::SynSent, A::SynTx),
            E::AppSend => (S::CloseWait, A::TxData),
            E::SeqRecv => (S::CloseWait, A::NewSeqRx),
            E::AppClose => (S::LastAck, A::FinAckTx),
            E::Timeout => (S::CloseWait, A::NoAct),
            E::AckRx => (S::CloseWait, A::NoAct),
            E::SynRx => (S::Closed, A::RstTx),
            E::SynAckRx => (S::Closed, A::RstTx),
            E::FinRx => (S::CloseWait, A::AckTx),
            E::FinAckRx => (S::CloseWait, A::AckTx),
            E::RstRx => (S::Closed, A::CancelTimer),
            E::BadFlags => (S::Closed, A::RstTx),
        },
        S::LastAck => match event {
            E::AppListen => (S::Closed, A::RstTx),
            E::AppConnect => (S::SynSent, A::SynTx),
            E::AppSend => (S::Closed, A::RstTx),
            E::SeqRecv => (S::LastAck, A::NewSeqRx),
            E::AppClose => (S::Closed, A::NoAct),
            E::Timeout => (S::Closed, A::NoAct),
            E::AckRx => (S::Closed, A::AppClosed),
            E::SynRx => (S::Closed, A::RstTx),
            E::SynAckRx => (S::Closed, A::RstTx),
            E::FinRx => (S::LastAck, A::FinAckTx),
            E::FinAckRx => (S::Closed, A::NoAct),
            E::RstRx => (S::Closed, A::CancelTimer),
            E::BadFlags => (S::Closed, A::RstTx),
        },
        S::FinWait1 => match event {
            E::AppListen => (S::Closed, A::RstTx),
            E::AppConnect => (S::Closed, A::RstTx),
            E::AppSend => (S::Closed, A::RstTx),
            E::SeqRecv => (S::FinWait1, A::NewSeqRx),
            E::AppClose => (S::FinWait1, A::NoAct),
            E::Timeout => (S::FinWait1, A::NoAct),
            E::AckRx => (S::FinWait2, A::NewAck),
            E::SynRx => (S::Closed, A::RstTx),
            E::SynAckRx => (S::Closed, A::RstTx),
            E::FinRx => (S::Closing, A::AckTx),
            E::FinAckRx => (S::TimeWait, A::AckTx),
            E::RstRx => (S::Closed, A::CancelTimer),
            E::BadFlags => (S::Closed, A::RstTx),
        },
        S::FinWait2 => match event {
            E::AppListen => (S::Closed, A::RstTx),
            E::AppConnect => (S::Closed, A::RstTx),
            E::AppSend => (S::Closed, A::RstTx),
            E::SeqRecv => (S::FinWait2, A::NewSeqRx),
            E::AppClose => (S::FinWait2, A::NoAct),
            E::Timeout => (S::FinWait2, A::NoAct),
            E::AckRx => (S::FinWait2, A::NewAck),
            E::SynRx => (S::Closed, A::RstTx),
            E::SynAckRx => (S::Closed, A::RstTx),
            E::FinRx => (S::TimeWait, A::AckTx),
            E::FinAckRx => (S::TimeWait, A::AckTx),
            E::RstRx => (S::Closed, A::CancelTimer),
            E::BadFlags => (S::Closed, A::RstTx),
        },
        S::Closing => match event {
            E::AppListen => (S::Closed, A::RstTx),
            E::AppConnect => (S::Closed, A::RstTx),
            E::AppSend => (S::Closed, A::RstTx),
            E::SeqRecv => (S::Closed, A::RstTx),
            E::AppClose => (S::Closed, A::RstTx),
            E::Timeout => (S::Closing, A::NoAct),
            E::AckRx => (S::TimeWait, A::NoAct),
            E::SynRx => (S::Closed, A::RstTx),
            E::SynAckRx => (S::Closed, A::RstTx),
            E::FinRx => (S::Closed, A::AckTx),
            E::FinAckRx => (S::Closed, A::AckTx),
            E::RstRx => (S::Closed, A::CancelTimer),
            E::BadFlags => (S::Closed, A::RstTx),
        },
        // Nothing leaves TIME-WAIT through the table.
        S::TimeWait => (S::TimeWait, A::NoAct),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_table_is_total() {
        for state in State::ALL {
            for event in Event::ALL {
                let _ = transition(state, event);
            }
        }
    }

    #[test]
    fn test_handshake_cells() {
        assert_eq!(
            transition(State::Closed, Event::AppConnect),
            (State::SynSent, Action::SynTx)
        );
        assert_eq!(
            transition(State::Listen, Event::SynRx),
            (State::Listen, Action::SynAckTx)
        );
        assert_eq!(
            transition(State::SynSent, Event::SynAckRx),
            (State::Established, Action::AckTx1)
        );
        assert_eq!(
            transition(State::SynReceived, Event::AckRx),
            (State::Established, Action::ServNotify)
        );
        // Simultaneous open.
        assert_eq!(
            transition(State::SynSent, Event::SynRx),
            (State::SynReceived, Action::SynAckTx)
        );
    }

    #[test]
    fn test_close_cells() {
        assert_eq!(
            transition(State::Established, Event::AppClose),
            (State::FinWait1, Action::FinTx)
        );
        assert_eq!(
            transition(State::Established, Event::FinAckRx),
            (State::CloseWait, Action::PeerClose)
        );
        assert_eq!(
            transition(State::CloseWait, Event::AppClose),
            (State::LastAck, Action::FinAckTx)
        );
        assert_eq!(
            transition(State::LastAck, Event::AckRx),
            (State::Closed, Action::AppClosed)
        );
        assert_eq!(
            transition(State::FinWait1, Event::AckRx),
            (State::FinWait2, Action::NewAck)
        );
        assert_eq!(
            transition(State::FinWait1, Event::FinAckRx),
            (State::TimeWait, Action::AckTx)
        );
        assert_eq!(
            transition(State::FinWait2, Event::FinRx),
            (State::TimeWait, Action::AckTx)
        );
        assert_eq!(
            transition(State::Closing, Event::AckRx),
            (State::TimeWait, Action::NoAct)
        );
        assert_eq!(
            transition(State::LastAck, Event::Timeout),
            (State::Closed, Action::NoAct)
        );
    }

    #[test]
    fn test_time_wait_absorbs_everything() {
        for event in Event::ALL {
            assert_eq!(
                transition(State::TimeWait, event),
                (State::TimeWait, Action::NoAct)
            );
        }
    }

    #[test]
    fn test_reset_closes_synchronized_states() {
        for state in [
            State::SynReceived,
            State::Established,
            State::CloseWait,
            State::LastAck,
            State::FinWait1,
            State::FinWait2,
            State::Closing,
        ] {
            assert_eq!(
                transition(state, Event::RstRx),
                (State::Closed, Action::CancelTimer)
            );
            assert_eq!(
                transition(state, Event::BadFlags),
                (State::Closed, Action::RstTx)
            );
        }
        assert_eq!(
            transition(State::SynSent, Event::RstRx),
            (State::Closed, Action::AppNotify)
        );
    }

    #[test]
    fn test_flags_to_event() {
        assert_eq!(Event::from_flags(0x00), Event::SeqRecv);
        assert_eq!(Event::from_flags(0x01), Event::FinRx);
        assert_eq!(Event::from_flags(0x02), Event::SynRx);
        assert_eq!(Event::from_flags(0x04), Event::RstRx);
        assert_eq!(Event::from_flags(0x10), Event::AckRx);
        assert_eq!(Event::from_flags(0x11), Event::FinAckRx);
        assert_eq!(Event::from_flags(0x12), Event::SynAckRx);
        assert_eq!(Event::from_flags(0x14), Event::RstRx);
        assert_eq!(Event::from_flags(0x03), Event::BadFlags);
        assert_eq!(Event::from_flags(0x06), Event::BadFlags);
        assert_eq!(Event::from_flags(0x17), Event::BadFlags);
        assert_eq!(Event::from_flags(0x40), Event::BadFlags);
        assert_eq!(Event::from_flags(0xff), Event::BadFlags);
    }

    #[test]
    fn test_flags_ignore_psh_and_urg() {
        for bits in 0u8..0x40 {
            assert_eq!(Event::from_flags(bits), Event::from_flags(bits & !0x28));
        }
        assert_eq!(Event::from_flags(0x18), Event::AckRx);
        assert_eq!(Event::from_flags(0x38), Event::AckRx);
        assert_eq!(Event::from_flags(0x28), Event::SeqRecv);
    }

    #[test]
    fn test_exclusive_control_bits() {
        for bits in 0u8..0x40 {
            let control = (bits & 0x07).count_ones();
            assert_eq!(Event::from_flags(bits) == Event::BadFlags, control > 1);
        }
    }

    #[test]
    fn test_segment_bound_actions() {
        assert!(Action::NewAck.needs_segment());
        assert!(Action::PeerClose.needs_segment());
        assert!(!Action::FinTx.needs_segment());
        assert!(!Action::TxData.needs_segment());
    }
}
