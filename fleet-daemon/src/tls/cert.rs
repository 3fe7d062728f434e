//! Serving identity of the daemon.

use zeroize::Zeroizing;

/// TLS identity bundle (certificate + private key in DER format).
#[derive(Clone)]
pub struct TlsIdentity {
    /// Certificate in DER format
    pub cert_der: Vec<u8>,
    /// Private key in PKCS#8 DER format
    pub key_der: Zeroizing<Vec<u8>>,
    /// Hex serial of the certificate
    pub serial_hex: String,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("serial", &self.serial_hex)
            .field("cert_der_len", &self.cert_der.len())
            .finish()
    }
}
