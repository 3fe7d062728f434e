//! PEM encoding for certificates and private keys.

use zeroize::Zeroizing;

use crate::keys::{KeyError, PrivateKey};

const CERTIFICATE_TAG: &str = "CERTIFICATE";
const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";

/// Errors that can occur while decoding PEM input.
#[derive(Debug, thiserror::Error)]
pub enum PemError {
    #[error("malformed PEM: {0}")]
    Malformed(#[from] pem::PemError),

    #[error("unexpected PEM block: expected {expected}, found {found}")]
    UnexpectedTag {
        expected: &'static str,
        found: String,
    },

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Encode a DER certificate as a PEM `CERTIFICATE` block.
pub fn encode_cert_pem(der: &[u8]) -> String {
    pem::encode(&pem::Pem::new(CERTIFICATE_TAG, der.to_vec()))
}

/// Decode the first PEM `CERTIFICATE` block into DER.
pub fn decode_cert_pem(input: &str) -> Result<Vec<u8>, PemError> {
    let block = pem::parse(input)?;
    if block.tag() != CERTIFICATE_TAG {
        return Err(PemError::UnexpectedTag {
            expected: CERTIFICATE_TAG,
            found: block.tag().to_string(),
        });
    }
    Ok(block.into_contents())
}

/// Encode a private key as a PKCS#8 PEM block.
pub fn encode_key_pem(key: &PrivateKey) -> Zeroizing<String> {
    key.to_pem()
}

/// Decode a PKCS#8 PEM private key.
pub fn decode_key_pem(input: &str) -> Result<PrivateKey, PemError> {
    let block = pem::parse(input)?;
    if block.tag() != PRIVATE_KEY_TAG {
        return Err(PemError::UnexpectedTag {
            expected: PRIVATE_KEY_TAG,
            found: block.tag().to_string(),
        });
    }
    Ok(PrivateKey::from_pem(input)?)
}
