//! The transition table driving dispatch of decoded messages
//!
//! Each entry names the state an IKE SA must be in, the exchange and
//! direction of the message, and the payloads/notifies that must be present
//! or absent. The first matching entry wins, so specific entries (cookie and
//! INVALID_KE answers) come before the general ones.

use ikewire::definitions::params::{ExchangeType, NotifyType, PayloadType};

use crate::md::MessageDigest;
use crate::state::IkeSaState;

/// What a handler tells the dispatcher about the message it processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Processing finished, state advanced, replies already queued
    Ok,
    /// Async work was posted; the SA keeps its pending record
    Suspend,
    /// The message was valid but changes nothing (duplicates, stale events)
    Ignore,
    /// Reject the request with this notify and tear the SA down
    Fail(NotifyType),
    /// Tear the SA down without a reply
    Fatal,
}

/// Names the handler function a transition dispatches to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerId {
    InitRequest,
    InitCookie,
    InitInvalidKe,
    InitRedirect,
    InitResponse,
    IntermediateRequest,
    IntermediateResponse,
    AuthRequest,
    AuthResponse,
    CreateChildRequest,
    CreateChildResponse,
    InfoRequest,
    InfoResponse,
}

/// One row of the table
pub(crate) struct Transition {
    /// States the SA may be in
    pub from: &'static [IkeSaState],
    /// Exchange of the message
    pub exchange: ExchangeType,
    /// Whether the message is a response
    pub response: bool,
    /// Payload types that must be present
    pub requires: &'static [PayloadType],
    /// Notify types that must be present
    pub requires_notify: &'static [NotifyType],
    /// Payload types that must be absent
    pub forbids: &'static [PayloadType],
    /// Where to dispatch
    pub handler: HandlerId,
}

pub(crate) static TRANSITIONS: &[Transition] = &[
    Transition {
        from: &[IkeSaState::Initial],
        exchange: ExchangeType::IkeSaInit,
        response: false,
        requires: &[
            PayloadType::SecurityAssociation,
            PayloadType::KeyExchange,
            PayloadType::Nonce,
        ],
        requires_notify: &[],
        forbids: &[],
        handler: HandlerId::InitRequest,
    },
    Transition {
        from: &[IkeSaState::InitSent],
        exchange: ExchangeType::IkeSaInit,
        response: true,
        requires: &[],
        requires_notify: &[NotifyType::Cookie],
        forbids: &[PayloadType::SecurityAssociation],
        handler: HandlerId::InitCookie,
    },
    Transition {
        from: &[IkeSaState::InitSent],
        exchange: ExchangeType::IkeSaInit,
        response: true,
        requires: &[],
        requires_notify: &[NotifyType::InvalidKePayload],
        forbids: &[PayloadType::SecurityAssociation],
        handler: HandlerId::InitInvalidKe,
    },
    Transition {
        from: &[IkeSaState::InitSent],
        exchange: ExchangeType::IkeSaInit,
        response: true,
        requires: &[],
        requires_notify: &[NotifyType::Redirect],
        forbids: &[PayloadType::SecurityAssociation],
        handler: HandlerId::InitRedirect,
    },
    Transition {
        from: &[IkeSaState::InitSent],
        exchange: ExchangeType::IkeSaInit,
        response: true,
        requires: &[
            PayloadType::SecurityAssociation,
            PayloadType::KeyExchange,
            PayloadType::Nonce,
        ],
        requires_notify: &[],
        forbids: &[],
        handler: HandlerId::InitResponse,
    },
    Transition {
        from: &[IkeSaState::RespondedInit],
        exchange: ExchangeType::IkeIntermediate,
        response: false,
        requires: &[PayloadType::KeyExchange],
        requires_notify: &[],
        forbids: &[],
        handler: HandlerId::IntermediateRequest,
    },
    Transition {
        from: &[IkeSaState::IntermediateSent],
        exchange: ExchangeType::IkeIntermediate,
        response: true,
        requires: &[PayloadType::KeyExchange],
        requires_notify: &[],
        forbids: &[],
        handler: HandlerId::IntermediateResponse,
    },
    Transition {
        from: &[IkeSaState::RespondedInit],
        exchange: ExchangeType::IkeAuth,
        response: false,
        requires: &[
            PayloadType::IdentificationInitiator,
            PayloadType::Authentication,
        ],
        requires_notify: &[],
        forbids: &[],
        handler: HandlerId::AuthRequest,
    },
    Transition {
        from: &[IkeSaState::AuthSent],
        exchange: ExchangeType::IkeAuth,
        response: true,
        requires: &[],
        requires_notify: &[],
        forbids: &[],
        handler: HandlerId::AuthResponse,
    },
    Transition {
        from: &[IkeSaState::Established],
        exchange: ExchangeType::CreateChildSa,
        response: false,
        requires: &[PayloadType::SecurityAssociation, PayloadType::Nonce],
        requires_notify: &[],
        forbids: &[],
        handler: HandlerId::CreateChildRequest,
    },
    Transition {
        from: &[IkeSaState::Established],
        exchange: ExchangeType::CreateChildSa,
        response: true,
        requires: &[],
        requires_notify: &[],
        forbids: &[],
        handler: HandlerId::CreateChildResponse,
    },
    Transition {
        from: &[IkeSaState::Established, IkeSaState::Deleting],
        exchange: ExchangeType::Informational,
        response: false,
        requires: &[],
        requires_notify: &[],
        forbids: &[],
        handler: HandlerId::InfoRequest,
    },
    Transition {
        from: &[IkeSaState::Established, IkeSaState::Deleting],
        exchange: ExchangeType::Informational,
        response: true,
        requires: &[],
        requires_notify: &[],
        forbids: &[],
        handler: HandlerId::InfoResponse,
    },
];

/// Pick the transition for a decoded message, if any
pub(crate) fn select(state: IkeSaState, md: &MessageDigest) -> Option<&'static Transition> {
    TRANSITIONS.iter().find(|transition| {
        transition.from.contains(&state)
            && transition.exchange == md.exchange_type
            && transition.response == md.response
            && transition.requires.iter().all(|required| md.has(*required))
            && transition
                .requires_notify
                .iter()
                .all(|required| md.notify(*required).is_some())
            && !transition.forbids.iter().any(|forbidden| md.has(*forbidden))
    })
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use ikewire::definitions::{Message, Notification, Payload, SecurityAssociation};

    use super::*;

    fn digest(
        exchange: ExchangeType,
        response: bool,
        payloads: Vec<Payload>,
    ) -> MessageDigest {
        MessageDigest::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 500),
            vec![],
            Message {
                initiator_spi: 1,
                responder_spi: 0,
                exchange_type: exchange,
                initiator: true,
                response,
                message_id: 0,
                payloads,
            },
        )
    }

    #[test]
    fn cookie_answer_beats_plain_init_response() {
        let md = digest(
            ExchangeType::IkeSaInit,
            true,
            vec![Payload::Notify(Notification::with_data(
                NotifyType::Cookie,
                vec![0x42; 16],
            ))],
        );
        let transition = select(IkeSaState::InitSent, &md).expect("transition");
        assert_eq!(transition.handler, HandlerId::InitCookie);
    }

    #[test]
    fn full_init_response_selects_the_general_row() {
        let md = digest(
            ExchangeType::IkeSaInit,
            true,
            vec![
                Payload::SecurityAssociation(SecurityAssociation::default()),
                Payload::KeyExchange(ikewire::definitions::KeyExchange {
                    group: ikewire::definitions::params::KeyExchangeMethod::Modp2048,
                    data: vec![0; 256],
                }),
                Payload::Nonce(vec![0x13; 32]),
            ],
        );
        let transition = select(IkeSaState::InitSent, &md).expect("transition");
        assert_eq!(transition.handler, HandlerId::InitResponse);
    }

    #[test]
    fn wrong_state_selects_nothing() {
        let md = digest(ExchangeType::Informational, false, vec![]);
        assert!(select(IkeSaState::InitSent, &md).is_none());
    }
}
