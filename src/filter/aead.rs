use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use super::block::BlockCodec;
use super::{FilterDescription, AES_GCM_FILTER_ID};
use crate::errors::{Error, ErrorCode};

/// length of the pre-shared key
pub const AES_GCM_KEY_LEN: usize = 32;

const AAD: &[u8] = b"wirecall-block";

static DESCRIPTION: FilterDescription = FilterDescription {
    name: "aes-256-gcm",
    id: AES_GCM_FILTER_ID,
    critical: true,
};

/// AES-256-GCM sealing of whole blocks, `[nonce][ciphertext][tag]`.
pub struct AesGcmCodec {
    key: LessSafeKey,
    rng: SystemRandom,
}

fn crypto_error(what: &str) -> Error {
    Error::filter(ErrorCode::FILTER, format!("aes-256-gcm: {what}"))
}

impl AesGcmCodec {
    /// key the codec
    pub fn new(key: &[u8; AES_GCM_KEY_LEN]) -> Result<Self, Error> {
        let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| crypto_error("bad key"))?;
        Ok(AesGcmCodec {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }
}

impl BlockCodec for AesGcmCodec {
    fn description(&self) -> &'static FilterDescription {
        &DESCRIPTION
    }

    fn seal(&mut self, clear: &[u8]) -> Result<Vec<u8>, Error> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| crypto_error("nonce generation failed"))?;

        let mut in_out = clear.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(AAD),
                &mut in_out,
            )
            .map_err(|_| crypto_error("seal failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    fn open(&mut self, block: &[u8]) -> Result<Vec<u8>, Error> {
        if block.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(crypto_error("block too short"));
        }
        let (nonce, sealed) = block.split_at(NONCE_LEN);
        let nonce =
            Nonce::try_assume_unique_for_key(nonce).map_err(|_| crypto_error("bad nonce"))?;
        let mut in_out = sealed.to_vec();
        let clear = self
            .key
            .open_in_place(nonce, Aad::from(AAD), &mut in_out)
            .map_err(|_| crypto_error("authentication failed"))?;
        Ok(clear.to_vec())
    }
}
