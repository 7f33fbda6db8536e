//! Proposal construction and first-match selection
//!
//! The responder picks the first offered proposal for which every transform
//! type of the local policy is satisfied by one of the offered transforms;
//! within a type, local preference order decides. The accepted proposal
//! echoes the offer's number and carries exactly one transform per type.

use itertools::Itertools;

use ikewire::definitions::params::{
    EncryptionAlgorithm, IntegrityAlgorithm, KeyExchangeMethod, PseudorandomFunction,
    SecurityProtocol, SequenceNumbers,
};
use ikewire::definitions::{Proposal, SecurityAssociation, Transform};

use crate::config::AlgorithmConfig;
use crate::state::{ChildAlgorithms, IkeAlgorithms};

/// Build the SA payload offer for the local policy as a single proposal
pub fn build_offer(
    policy: &AlgorithmConfig,
    protocol: SecurityProtocol,
    spi: Option<Vec<u8>>,
) -> SecurityAssociation {
    let mut proposal = Proposal::new_empty(1, protocol, spi);
    proposal.add(
        policy
            .encryption
            .iter()
            .map(|(alg, len)| Transform::Encryption(*alg, *len))
            .collect(),
    );
    proposal.add(
        policy
            .prf
            .iter()
            .map(|p| Transform::PseudoRandomFunction(*p))
            .collect(),
    );
    proposal.add(
        policy
            .integrity
            .iter()
            // integrity NONE is implied by AEAD and not put on the wire
            .filter(|i| **i != IntegrityAlgorithm::None)
            .map(|i| Transform::Integrity(*i))
            .collect(),
    );
    proposal.add(
        policy
            .key_exchange
            .iter()
            .map(|k| Transform::KeyExchange(*k))
            .collect(),
    );
    proposal.add(
        policy
            .sequence_numbers
            .iter()
            .map(|s| Transform::SequenceNumber(*s))
            .collect(),
    );
    SecurityAssociation {
        proposals: vec![proposal],
    }
}

/// What first-match selection produced for an IKE offer
#[derive(Debug, Clone)]
pub struct SelectedIke {
    /// Number of the accepted offer proposal
    pub number: u8,
    /// SPI the offer carried (rekey exchanges)
    pub spi: Vec<u8>,
    /// The agreed suite
    pub algorithms: IkeAlgorithms,
}

/// What first-match selection produced for an ESP/AH offer
#[derive(Debug, Clone)]
pub struct SelectedChild {
    /// Number of the accepted offer proposal
    pub number: u8,
    /// SPI the offer carried (the peer's inbound SPI)
    pub spi: Vec<u8>,
    /// The agreed suite
    pub algorithms: ChildAlgorithms,
}

fn pick_encryption(
    policy: &AlgorithmConfig,
    offered: &[(EncryptionAlgorithm, Option<u16>)],
) -> Option<(EncryptionAlgorithm, Option<u16>)> {
    policy
        .encryption
        .iter()
        .find(|wanted| offered.contains(wanted))
        .copied()
}

fn pick_prf(
    policy: &AlgorithmConfig,
    offered: &[PseudorandomFunction],
) -> Option<PseudorandomFunction> {
    policy.prf.iter().find(|p| offered.contains(p)).copied()
}

fn pick_integrity(
    policy: &AlgorithmConfig,
    offered: &[IntegrityAlgorithm],
    aead: bool,
) -> Option<IntegrityAlgorithm> {
    if aead {
        // an AEAD cipher either has no integrity transform or NONE offered
        if offered.is_empty() || offered.contains(&IntegrityAlgorithm::None) {
            return Some(IntegrityAlgorithm::None);
        }
        return None;
    }
    policy
        .integrity
        .iter()
        .filter(|i| **i != IntegrityAlgorithm::None)
        .find(|i| offered.contains(i))
        .copied()
}

fn pick_ke(
    policy: &AlgorithmConfig,
    offered: &[KeyExchangeMethod],
) -> Option<KeyExchangeMethod> {
    policy
        .key_exchange
        .iter()
        .find(|k| offered.contains(k))
        .copied()
}

/// Select from an offered IKE SA payload
pub fn select_ike(
    policy: &AlgorithmConfig,
    offer: &SecurityAssociation,
) -> Option<SelectedIke> {
    offer
        .proposals
        .iter()
        .filter(|p| p.protocol == SecurityProtocol::InternetKeyExchange)
        .find_map(|proposal| {
            let encryption = pick_encryption(policy, &proposal.encryption_algorithms)?;
            let prf = pick_prf(policy, &proposal.pseudo_random_functions)?;
            let integrity = pick_integrity(
                policy,
                &proposal.integrity_algorithms,
                encryption.0.is_aead(),
            )?;
            let key_exchange = pick_ke(policy, &proposal.key_exchange_methods)?;
            Some(SelectedIke {
                number: proposal.number,
                spi: proposal.spi.clone(),
                algorithms: IkeAlgorithms {
                    encryption,
                    prf,
                    integrity,
                    key_exchange,
                },
            })
        })
}

/// Select from an offered ESP/AH SA payload
///
/// `require_pfs_group` narrows the KE transform on child rekeys where the
/// exchange's KE payload already fixed the group.
pub fn select_child(
    policy: &AlgorithmConfig,
    offer: &SecurityAssociation,
) -> Option<SelectedChild> {
    offer
        .proposals
        .iter()
        .filter(|p| {
            matches!(
                p.protocol,
                SecurityProtocol::EncapsulatingSecurityPayload
                    | SecurityProtocol::AuthenticationHeader
            )
        })
        .find_map(|proposal| {
            let encryption = pick_encryption(policy, &proposal.encryption_algorithms)?;
            let integrity = pick_integrity(
                policy,
                &proposal.integrity_algorithms,
                encryption.0.is_aead(),
            )?;
            let sequence_numbers = if proposal.sequence_numbers.is_empty() {
                SequenceNumbers::NoExtended
            } else {
                *policy
                    .sequence_numbers
                    .iter()
                    .find(|s| proposal.sequence_numbers.contains(s))?
            };
            // PFS only when both sides list a group
            if !proposal.key_exchange_methods.is_empty()
                && !policy.key_exchange.is_empty()
                && pick_ke(policy, &proposal.key_exchange_methods).is_none()
            {
                return None;
            }
            Some(SelectedChild {
                number: proposal.number,
                spi: proposal.spi.clone(),
                algorithms: ChildAlgorithms {
                    protocol: proposal.protocol,
                    encryption,
                    integrity,
                    sequence_numbers,
                },
            })
        })
}

/// The single-proposal SA payload echoing an accepted IKE selection
pub fn accepted_ike_sa(selected: &SelectedIke, spi: Option<Vec<u8>>) -> SecurityAssociation {
    let mut proposal = Proposal::new_empty(
        selected.number,
        SecurityProtocol::InternetKeyExchange,
        spi,
    );
    let algorithms = &selected.algorithms;
    proposal.add(vec![Transform::Encryption(
        algorithms.encryption.0,
        algorithms.encryption.1,
    )]);
    proposal.add(vec![Transform::PseudoRandomFunction(algorithms.prf)]);
    if algorithms.integrity != IntegrityAlgorithm::None {
        proposal.add(vec![Transform::Integrity(algorithms.integrity)]);
    }
    proposal.add(vec![Transform::KeyExchange(algorithms.key_exchange)]);
    SecurityAssociation {
        proposals: vec![proposal],
    }
}

/// The single-proposal SA payload echoing an accepted child selection, with
/// our inbound SPI and the PFS group when one is in play
pub fn accepted_child_sa(
    selected: &SelectedChild,
    our_spi: u32,
    pfs_group: Option<KeyExchangeMethod>,
) -> SecurityAssociation {
    let mut proposal = Proposal::new_empty(
        selected.number,
        selected.algorithms.protocol,
        Some(our_spi.to_be_bytes().to_vec()),
    );
    proposal.add(vec![Transform::Encryption(
        selected.algorithms.encryption.0,
        selected.algorithms.encryption.1,
    )]);
    if selected.algorithms.integrity != IntegrityAlgorithm::None {
        proposal.add(vec![Transform::Integrity(selected.algorithms.integrity)]);
    }
    if let Some(group) = pfs_group {
        proposal.add(vec![Transform::KeyExchange(group)]);
    }
    proposal.add(vec![Transform::SequenceNumber(
        selected.algorithms.sequence_numbers,
    )]);
    SecurityAssociation {
        proposals: vec![proposal],
    }
}

/// Check the subset property: every transform of an accepted proposal must
/// appear in the matching offer proposal
pub fn accepted_is_subset(accepted: &Proposal, offer: &SecurityAssociation) -> bool {
    let Some(offered) = offer
        .proposals
        .iter()
        .find(|p| p.number == accepted.number && p.protocol == accepted.protocol)
    else {
        return false;
    };
    let offered_transforms: Vec<Transform> = offered.transforms().collect_vec();
    accepted.transforms().all(|transform| {
        // NONE integrity may be implied rather than offered
        transform == Transform::Integrity(IntegrityAlgorithm::None)
            || offered_transforms.contains(&transform)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AlgorithmConfig {
        AlgorithmConfig {
            encryption: vec![
                (EncryptionAlgorithm::AesGcm16, Some(256)),
                (EncryptionAlgorithm::ChaCha20Poly1305, None),
            ],
            prf: vec![PseudorandomFunction::HmacSha2_256],
            integrity: vec![IntegrityAlgorithm::None],
            key_exchange: vec![KeyExchangeMethod::Modp2048, KeyExchangeMethod::Curve25519],
            sequence_numbers: vec![SequenceNumbers::NoExtended],
        }
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn first_matching_offer_wins() {
        let mut weak = Proposal::new_empty(1, SecurityProtocol::InternetKeyExchange, None);
        weak.add(vec![
            Transform::Encryption(EncryptionAlgorithm::AesCbc, Some(128)),
            Transform::PseudoRandomFunction(PseudorandomFunction::HmacSha2_256),
            Transform::KeyExchange(KeyExchangeMethod::Modp2048),
        ]);
        let mut good = Proposal::new_empty(2, SecurityProtocol::InternetKeyExchange, None);
        good.add(vec![
            Transform::Encryption(EncryptionAlgorithm::ChaCha20Poly1305, None),
            Transform::Encryption(EncryptionAlgorithm::AesGcm16, Some(256)),
            Transform::PseudoRandomFunction(PseudorandomFunction::HmacSha2_256),
            Transform::KeyExchange(KeyExchangeMethod::Curve25519),
        ]);
        let offer = SecurityAssociation {
            proposals: vec![weak, good],
        };

        let selected = select_ike(&policy(), &offer).expect("proposal 2 matches");
        assert_eq!(selected.number, 2);
        // local preference order decides within the offered set
        assert_eq!(
            selected.algorithms.encryption,
            (EncryptionAlgorithm::AesGcm16, Some(256))
        );
        assert_eq!(selected.algorithms.key_exchange, KeyExchangeMethod::Curve25519);

        let accepted = accepted_ike_sa(&selected, None);
        assert!(accepted_is_subset(&accepted.proposals[0], &offer));
    }

    #[test]
    fn no_common_suite_selects_nothing() {
        let mut offered = Proposal::new_empty(1, SecurityProtocol::InternetKeyExchange, None);
        offered.add(vec![
            Transform::Encryption(EncryptionAlgorithm::AesCbc, Some(128)),
            Transform::PseudoRandomFunction(PseudorandomFunction::HmacSha2_512),
            Transform::KeyExchange(KeyExchangeMethod::Curve448),
        ]);
        let offer = SecurityAssociation {
            proposals: vec![offered],
        };
        assert!(select_ike(&policy(), &offer).is_none());
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn esp_selection_keeps_spi_and_esn() {
        let mut offered = Proposal::new_empty(
            1,
            SecurityProtocol::EncapsulatingSecurityPayload,
            Some(vec![0xa1, 0xa1, 0xa1, 0xa1]),
        );
        offered.add(vec![
            Transform::Encryption(EncryptionAlgorithm::AesGcm16, Some(256)),
            Transform::SequenceNumber(SequenceNumbers::NoExtended),
        ]);
        let offer = SecurityAssociation {
            proposals: vec![offered],
        };
        let selected = select_child(&policy(), &offer).expect("matches");
        assert_eq!(selected.spi, vec![0xa1, 0xa1, 0xa1, 0xa1]);
        assert_eq!(
            selected.algorithms.sequence_numbers,
            SequenceNumbers::NoExtended
        );
    }
}
