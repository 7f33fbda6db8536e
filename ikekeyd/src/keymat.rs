//! The IKEv2 key schedule (RFC 7296 sections 2.13-2.17, RFC 8784)

use ikecrypto::prf::{prf_chunks, prf_plus};
use ikecrypto::{CryptoError, SymKey};
use ikewire::definitions::params::PseudorandomFunction;

use crate::state::IkeAlgorithms;

/// The full derived key set of one IKE SA
#[derive(Debug, Clone)]
pub struct SkeyMat {
    /// Seed for child and rekey derivations
    pub sk_d: SymKey,
    /// Integrity key, initiator to responder (empty with AEAD)
    pub sk_ai: SymKey,
    /// Integrity key, responder to initiator (empty with AEAD)
    pub sk_ar: SymKey,
    /// Encryption keymat, initiator to responder
    pub sk_ei: SymKey,
    /// Encryption keymat, responder to initiator
    pub sk_er: SymKey,
    /// AUTH payload key of the initiator
    pub sk_pi: SymKey,
    /// AUTH payload key of the responder
    pub sk_pr: SymKey,
}

/// The keys RFC 8784 re-derives when a PPK is mixed in, in their original
/// no-PPK form so NO_PPK_AUTH stays computable
#[derive(Debug, Clone)]
pub struct NoPpkShadow {
    /// Original SK_d
    pub sk_d: SymKey,
    /// Original SK_pi
    pub sk_pi: SymKey,
    /// Original SK_pr
    pub sk_pr: SymKey,
}

/// SKEYSEED of the initial exchange: prf(Ni | Nr, g^ir)
pub fn skeyseed_initial(
    prf_alg: PseudorandomFunction,
    local_then_peer_nonces: (&[u8], &[u8]),
    shared: &SymKey,
) -> Result<SymKey, CryptoError> {
    let (ni, nr) = local_then_peer_nonces;
    let mut key = Vec::with_capacity(ni.len() + nr.len());
    key.extend_from_slice(ni);
    key.extend_from_slice(nr);
    Ok(SymKey::new(prf_chunks(prf_alg, &key, &[shared.as_bytes()])?))
}

/// SKEYSEED of a rekey or IKE_INTERMEDIATE re-derivation:
/// prf(SK_d (old), g^ir (new) | Ni | Nr)
pub fn skeyseed_rekey(
    prf_alg: PseudorandomFunction,
    old_sk_d: &SymKey,
    shared: &SymKey,
    ni: &[u8],
    nr: &[u8],
) -> Result<SymKey, CryptoError> {
    Ok(SymKey::new(prf_chunks(
        prf_alg,
        old_sk_d.as_bytes(),
        &[shared.as_bytes(), ni, nr],
    )?))
}

/// Expand SKEYSEED into the seven SK_* keys of the negotiated sizes
pub fn derive_ike_keys(
    algorithms: &IkeAlgorithms,
    skeyseed: &SymKey,
    ni: &[u8],
    nr: &[u8],
    initiator_spi: u64,
    responder_spi: u64,
) -> Result<SkeyMat, CryptoError> {
    let prf_alg = algorithms.prf;
    let prf_size = prf_alg.output_size();
    let integ_size = algorithms.integrity.key_size();
    let encr_size =
        ikecrypto::aead::AeadKey::keymat_size(algorithms.encryption.0, algorithms.encryption.1)?;

    let mut seed = Vec::with_capacity(ni.len() + nr.len() + 16);
    seed.extend_from_slice(ni);
    seed.extend_from_slice(nr);
    seed.extend_from_slice(&initiator_spi.to_be_bytes());
    seed.extend_from_slice(&responder_spi.to_be_bytes());

    let total = prf_size + 2 * integ_size + 2 * encr_size + 2 * prf_size;
    let stream = prf_plus(prf_alg, skeyseed.as_bytes(), &seed, total)?;

    let mut offset = 0usize;
    let mut take = |len: usize| {
        let piece = SymKey::new(stream[offset..offset + len].to_vec());
        offset += len;
        piece
    };

    Ok(SkeyMat {
        sk_d: take(prf_size),
        sk_ai: take(integ_size),
        sk_ar: take(integ_size),
        sk_ei: take(encr_size),
        sk_er: take(encr_size),
        sk_pi: take(prf_size),
        sk_pr: take(prf_size),
    })
}

/// Child SA keymat: prf+(SK_d, [g^ir |] Ni | Nr), split into the
/// initiator-to-responder keys first
pub fn derive_child_keymat(
    prf_alg: PseudorandomFunction,
    sk_d: &SymKey,
    pfs_shared: Option<&SymKey>,
    ni: &[u8],
    nr: &[u8],
    keymat_size: usize,
) -> Result<(SymKey, SymKey), CryptoError> {
    let mut seed = vec![];
    if let Some(shared) = pfs_shared {
        seed.extend_from_slice(shared.as_bytes());
    }
    seed.extend_from_slice(ni);
    seed.extend_from_slice(nr);

    let stream = prf_plus(prf_alg, sk_d.as_bytes(), &seed, 2 * keymat_size)?;
    Ok((
        SymKey::new(stream[..keymat_size].to_vec()),
        SymKey::new(stream[keymat_size..].to_vec()),
    ))
}

/// Mix a PPK into SK_d, SK_pi and SK_pr (RFC 8784 section 3.2), returning
/// the replaced keys so they can be kept as the no-PPK shadow
pub fn mix_ppk(
    prf_alg: PseudorandomFunction,
    ppk: &[u8],
    keys: &mut SkeyMat,
) -> Result<NoPpkShadow, CryptoError> {
    let size = prf_alg.output_size();
    let shadow = NoPpkShadow {
        sk_d: keys.sk_d.clone(),
        sk_pi: keys.sk_pi.clone(),
        sk_pr: keys.sk_pr.clone(),
    };
    keys.sk_d = SymKey::new(prf_plus(prf_alg, ppk, shadow.sk_d.as_bytes(), size)?);
    keys.sk_pi = SymKey::new(prf_plus(prf_alg, ppk, shadow.sk_pi.as_bytes(), size)?);
    keys.sk_pr = SymKey::new(prf_plus(prf_alg, ppk, shadow.sk_pr.as_bytes(), size)?);
    Ok(shadow)
}

#[cfg(test)]
mod tests {
    use ikewire::definitions::params::{
        EncryptionAlgorithm, IntegrityAlgorithm, KeyExchangeMethod,
    };

    use super::*;

    fn algorithms() -> IkeAlgorithms {
        IkeAlgorithms {
            encryption: (EncryptionAlgorithm::AesGcm16, Some(256)),
            prf: PseudorandomFunction::HmacSha2_256,
            integrity: IntegrityAlgorithm::None,
            key_exchange: KeyExchangeMethod::Modp2048,
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn both_sides_derive_identical_keys() {
        let shared = SymKey::new(vec![0x5a; 256]);
        let (ni, nr) = (vec![0x01; 32], vec![0x02; 32]);

        let seed_a =
            skeyseed_initial(PseudorandomFunction::HmacSha2_256, (&ni, &nr), &shared).unwrap();
        let seed_b =
            skeyseed_initial(PseudorandomFunction::HmacSha2_256, (&ni, &nr), &shared).unwrap();
        assert_eq!(seed_a.as_bytes(), seed_b.as_bytes());

        let keys_a = derive_ike_keys(&algorithms(), &seed_a, &ni, &nr, 0x1111, 0x2222).unwrap();
        let keys_b = derive_ike_keys(&algorithms(), &seed_b, &ni, &nr, 0x1111, 0x2222).unwrap();
        assert_eq!(keys_a.sk_d.as_bytes(), keys_b.sk_d.as_bytes());
        assert_eq!(keys_a.sk_ei.as_bytes(), keys_b.sk_ei.as_bytes());
        assert_eq!(keys_a.sk_er.as_bytes(), keys_b.sk_er.as_bytes());
        assert_eq!(keys_a.sk_pi.as_bytes(), keys_b.sk_pi.as_bytes());
        assert_eq!(keys_a.sk_pr.as_bytes(), keys_b.sk_pr.as_bytes());

        // AEAD suite: no integrity keys, 36 octet cipher keymat, prf sized rest
        assert!(keys_a.sk_ai.is_empty());
        assert_eq!(keys_a.sk_ei.len(), 36);
        assert_eq!(keys_a.sk_d.len(), 32);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn directional_keys_differ() {
        let shared = SymKey::new(vec![0x5a; 256]);
        let seed = skeyseed_initial(
            PseudorandomFunction::HmacSha2_256,
            (&[0x01; 32], &[0x02; 32]),
            &shared,
        )
        .unwrap();
        let keys =
            derive_ike_keys(&algorithms(), &seed, &[0x01; 32], &[0x02; 32], 1, 2).unwrap();
        assert_ne!(keys.sk_ei.as_bytes(), keys.sk_er.as_bytes());
        assert_ne!(keys.sk_pi.as_bytes(), keys.sk_pr.as_bytes());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn ppk_mixing_replaces_and_shadows() {
        let shared = SymKey::new(vec![0x5a; 256]);
        let seed = skeyseed_initial(
            PseudorandomFunction::HmacSha2_256,
            (&[0x01; 32], &[0x02; 32]),
            &shared,
        )
        .unwrap();
        let mut keys =
            derive_ike_keys(&algorithms(), &seed, &[0x01; 32], &[0x02; 32], 1, 2).unwrap();
        let sk_ei_before = keys.sk_ei.clone();

        let shadow = mix_ppk(PseudorandomFunction::HmacSha2_256, b"ppk secret", &mut keys).unwrap();
        assert_ne!(shadow.sk_d.as_bytes(), keys.sk_d.as_bytes());
        assert_ne!(shadow.sk_pi.as_bytes(), keys.sk_pi.as_bytes());
        assert_ne!(shadow.sk_pr.as_bytes(), keys.sk_pr.as_bytes());
        // the transport keys stay untouched
        assert_eq!(sk_ei_before.as_bytes(), keys.sk_ei.as_bytes());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn child_keymat_directions_split() {
        let sk_d = SymKey::new(vec![0x11; 32]);
        let (i_to_r, r_to_i) = derive_child_keymat(
            PseudorandomFunction::HmacSha2_256,
            &sk_d,
            None,
            &[0x01; 32],
            &[0x02; 32],
            36,
        )
        .unwrap();
        assert_eq!(i_to_r.len(), 36);
        assert_eq!(r_to_i.len(), 36);
        assert_ne!(i_to_r.as_bytes(), r_to_i.as_bytes());
    }
}
