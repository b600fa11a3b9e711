//! Narinfo signing and verification.

use crate::error::{SignerError, SignerResult};
use crate::key::{KeyPair, PublicKey};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::Signer as _;
use ed25519_dalek::Verifier;
use larder_core::config::SigningConfig;
use larder_core::narinfo::{NarInfo, Signature};

/// Signs narinfo fingerprints with an in-memory ed25519 key.
///
/// The secret never leaves this type; callers only see signatures and the
/// public key.
pub struct NarInfoSigner {
    keypair: KeyPair,
}

impl NarInfoSigner {
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    pub fn from_nix_secret_key(s: &str) -> SignerResult<Self> {
        KeyPair::from_nix_secret_key(s).map(Self::new)
    }

    /// A signer with a fresh random key.
    pub fn generate(key_name: impl Into<String>) -> Self {
        Self::new(KeyPair::generate(key_name))
    }

    /// Load the configured key. Callers treat failure as fatal.
    pub fn from_config(config: &SigningConfig) -> SignerResult<Self> {
        KeyPair::load(config).map(Self::new)
    }

    pub fn key_name(&self) -> &str {
        &self.keypair.name
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public
    }

    pub fn nix_public_key(&self) -> String {
        self.keypair.to_nix_public_key()
    }

    pub fn sign_fingerprint(&self, fingerprint: &str) -> Signature {
        let raw = self
            .keypair
            .secret
            .signing_key()
            .sign(fingerprint.as_bytes());
        Signature::new(self.key_name(), STANDARD.encode(raw.to_bytes()))
    }
}

/// Signs narinfos as they are served. Swappable at runtime, so a key
/// rotation affects every later fetch without touching stored data.
pub trait Signer: Send + Sync {
    fn sign_fingerprint(&self, fingerprint: &str) -> Signature;

    fn key_name(&self) -> &str;

    /// `name:base64` public key for `trusted-public-keys`.
    fn nix_public_key(&self) -> String;

    /// Append a signature over the narinfo's fingerprint.
    fn sign(&self, narinfo: &mut NarInfo) {
        let signature = self.sign_fingerprint(&narinfo.fingerprint());
        narinfo.add_signature(signature);
    }
}

impl Signer for NarInfoSigner {
    fn sign_fingerprint(&self, fingerprint: &str) -> Signature {
        NarInfoSigner::sign_fingerprint(self, fingerprint)
    }

    fn key_name(&self) -> &str {
        NarInfoSigner::key_name(self)
    }

    fn nix_public_key(&self) -> String {
        NarInfoSigner::nix_public_key(self)
    }
}

/// Check one signature against `public_key`.
pub fn verify_signature(
    narinfo: &NarInfo,
    signature: &Signature,
    public_key: &PublicKey,
) -> SignerResult<()> {
    let decoded = STANDARD
        .decode(&signature.signature)
        .map_err(|e| SignerError::InvalidSignature(format!("not base64: {e}")))?;
    let bytes: [u8; 64] = decoded.as_slice().try_into().map_err(|_| {
        SignerError::InvalidSignature(format!("{} bytes, want 64", decoded.len()))
    })?;

    public_key
        .verifying_key()
        .verify(
            narinfo.fingerprint().as_bytes(),
            &ed25519_dalek::Signature::from_bytes(&bytes),
        )
        .map_err(|_| SignerError::VerificationFailed)
}

/// Whether any signature on the narinfo verifies under a trusted key of
/// the same name.
pub fn verify_narinfo(
    narinfo: &NarInfo,
    trusted_keys: &[(String, PublicKey)],
) -> SignerResult<bool> {
    Ok(narinfo.signatures.iter().any(|sig| {
        trusted_keys
            .iter()
            .filter(|(name, _)| *name == sig.key_name)
            .any(|(_, key)| verify_signature(narinfo, sig, key).is_ok())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_core::hash::NarHash;
    use larder_core::store_path::StorePath;

    fn sample_narinfo() -> NarInfo {
        let store_path =
            StorePath::parse("/nix/store/0c7hgw0hhvw3dp7jz5r5r2a8nmhxq6hw-hello-2.12").unwrap();
        let mut narinfo = NarInfo::new(store_path, NarHash::compute(b"nar bytes"), 12345);
        narinfo.references = vec![
            StorePath::parse("/nix/store/1b9p07z77phvv2hf6gm9f28syp39f1ag-glibc-2.39").unwrap(),
        ];
        narinfo
    }

    #[test]
    fn test_signature_verifies_under_signing_key_only() {
        let signer = NarInfoSigner::generate("larder-1");
        let other = NarInfoSigner::generate("larder-2");
        let mut narinfo = sample_narinfo();
        signer.sign(&mut narinfo);

        assert_eq!(narinfo.signatures.len(), 1);
        let sig = &narinfo.signatures[0];
        assert_eq!(sig.key_name, "larder-1");
        verify_signature(&narinfo, sig, signer.public_key()).unwrap();
        assert!(matches!(
            verify_signature(&narinfo, sig, other.public_key()),
            Err(SignerError::VerificationFailed)
        ));
    }

    #[test]
    fn test_garbage_signature_is_rejected() {
        let signer = NarInfoSigner::generate("larder-1");
        let narinfo = sample_narinfo();
        let bogus = Signature::new("larder-1", "not-base64!!");
        assert!(matches!(
            verify_signature(&narinfo, &bogus, signer.public_key()),
            Err(SignerError::InvalidSignature(_))
        ));
        let short = Signature::new("larder-1", STANDARD.encode([0u8; 10]));
        assert!(matches!(
            verify_signature(&narinfo, &short, signer.public_key()),
            Err(SignerError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_verify_narinfo_matches_key_by_name() {
        let signer = NarInfoSigner::generate("larder-1");
        let mut narinfo = sample_narinfo();
        signer.sign(&mut narinfo);

        let right = vec![("larder-1".to_string(), signer.public_key().clone())];
        assert!(verify_narinfo(&narinfo, &right).unwrap());

        // Correct key bytes under a different name do not count.
        let renamed = vec![("other".to_string(), signer.public_key().clone())];
        assert!(!verify_narinfo(&narinfo, &renamed).unwrap());
    }

    #[test]
    fn test_signature_covers_metadata() {
        let signer = NarInfoSigner::generate("cache-1");
        let mut narinfo = sample_narinfo();
        signer.sign(&mut narinfo);

        // Changing any fingerprinted field invalidates the signature.
        let mut tampered = narinfo.clone();
        tampered.nar_size += 1;
        assert!(verify_signature(&tampered, &narinfo.signatures[0], signer.public_key()).is_err());

        let mut tampered = narinfo.clone();
        tampered.references.clear();
        assert!(verify_signature(&tampered, &narinfo.signatures[0], signer.public_key()).is_err());
    }

    #[test]
    fn test_signature_survives_text_roundtrip() {
        let signer = NarInfoSigner::generate("cache-1");
        let mut narinfo = sample_narinfo();
        signer.sign(&mut narinfo);

        let parsed = NarInfo::parse(&narinfo.to_narinfo_text()).unwrap();
        let (name, public) = PublicKey::from_nix_format(&signer.nix_public_key()).unwrap();
        assert!(verify_narinfo(&parsed, &[(name, public)]).unwrap());
    }

    #[test]
    fn test_dyn_signer() {
        let signer: std::sync::Arc<dyn Signer> =
            std::sync::Arc::new(NarInfoSigner::generate("cache-2"));
        let mut narinfo = sample_narinfo();
        signer.sign(&mut narinfo);
        assert_eq!(narinfo.signatures[0].key_name, "cache-2");
        assert!(signer.nix_public_key().starts_with("cache-2:"));
    }
}
