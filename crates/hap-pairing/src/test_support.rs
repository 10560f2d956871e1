//! Controller-side helpers for engine tests.

use std::sync::Arc;

use hap_crypto::{
    chacha::{decrypt_with_nonce, encrypt_with_nonce, nonce_from_string},
    ed25519::{self, LongTermKeyPair},
    hkdf,
    keys::SessionKeys,
    srp::{SrpChallenge, SrpClient, SrpProof, PAIR_SETUP_USERNAME},
    tlv::{methods, Tlv8, TlvType},
    EphemeralKeyPair,
};

use crate::{AccessoryIdentity, MemoryPairingStore, PairingContext, PairingRecord, PairingStore, SetupSecret};

pub(crate) const CODE: &str = "031-45-154";

pub(crate) fn context(capacity: usize) -> PairingContext {
    context_with_store(Arc::new(MemoryPairingStore::new(capacity)))
}

pub(crate) fn context_with_store(store: Arc<dyn PairingStore>) -> PairingContext {
    PairingContext::new(AccessoryIdentity::generate(), SetupSecret::code(CODE), store)
}

pub(crate) struct SetupDriver {
    id: String,
    keypair: LongTermKeyPair,
    srp: SrpClient,
    proof: Option<SrpProof>,
}

impl SetupDriver {
    pub fn new(id: &str, code: &str) -> Self {
        Self {
            id: id.to_string(),
            keypair: LongTermKeyPair::generate(),
            srp: SrpClient::new(PAIR_SETUP_USERNAME, code.as_bytes()),
            proof: None,
        }
    }

    pub fn m1(&self) -> Vec<u8> {
        Tlv8::new()
            .with(TlvType::State, [1])
            .with(TlvType::Method, [methods::PAIR_SETUP])
            .encode()
    }

    pub fn m3(&mut self, m2: &Tlv8) -> Vec<u8> {
        let challenge = SrpChallenge {
            salt: m2.get(TlvType::Salt).unwrap().try_into().unwrap(),
            server_public_key: m2.get(TlvType::PublicKey).unwrap().to_vec(),
        };
        let proof = self.srp.process_challenge(&challenge).unwrap();
        let request = Tlv8::new()
            .with(TlvType::State, [3])
            .with(TlvType::PublicKey, self.srp.public_key())
            .with(TlvType::Proof, proof.client_proof.clone());
        self.proof = Some(proof);
        request.encode()
    }

    pub fn check_m4(&self, m4: &Tlv8) -> bool {
        let proof = self.proof.as_ref().unwrap();
        m4.get(TlvType::Proof)
            .map(|p| self.srp.verify_server_proof(p, &proof.expected_server_proof))
            .unwrap_or(false)
    }

    pub fn m5(&self) -> Vec<u8> {
        let k = &self.proof.as_ref().unwrap().shared_secret;
        let setup_key = hkdf::derive_pair_setup_key(k).unwrap();
        let x = hkdf::derive_controller_sign_key(k).unwrap();

        let mut info = x.to_vec();
        info.extend_from_slice(self.id.as_bytes());
        info.extend_from_slice(&self.keypair.public_key());
        let sub = Tlv8::new()
            .with(TlvType::Identifier, self.id.as_bytes())
            .with(TlvType::PublicKey, self.keypair.public_key())
            .with(TlvType::Signature, self.keypair.sign(&info));
        let sealed =
            encrypt_with_nonce(&setup_key, &nonce_from_string(b"PS-Msg05"), &sub.encode()).unwrap();

        Tlv8::new()
            .with(TlvType::State, [5])
            .with(TlvType::EncryptedData, sealed)
            .encode()
    }

    /// Decrypt M6 and check the accessory signature. Returns `(device id, LTPK)`.
    pub fn open_m6(&self, m6: &Tlv8) -> (String, [u8; 32]) {
        let k = &self.proof.as_ref().unwrap().shared_secret;
        let setup_key = hkdf::derive_pair_setup_key(k).unwrap();
        let plaintext = decrypt_with_nonce(
            &setup_key,
            &nonce_from_string(b"PS-Msg06"),
            m6.get(TlvType::EncryptedData).unwrap(),
        )
        .unwrap();
        let sub = Tlv8::parse(&plaintext).unwrap();

        let id = sub.get(TlvType::Identifier).unwrap();
        let ltpk: [u8; 32] = sub.get(TlvType::PublicKey).unwrap().try_into().unwrap();
        let mut info = hkdf::derive_accessory_sign_key(k).unwrap().to_vec();
        info.extend_from_slice(id);
        info.extend_from_slice(&ltpk);
        ed25519::verify(&ltpk, &info, sub.get(TlvType::Signature).unwrap()).unwrap();

        (String::from_utf8(id.to_vec()).unwrap(), ltpk)
    }
}

/// Paired controller running pair-verify.
pub(crate) struct VerifyDriver {
    id: String,
    keypair: LongTermKeyPair,
    ephemeral: EphemeralKeyPair,
    shared: Option<[u8; 32]>,
}

impl VerifyDriver {
    pub fn new(id: &str) -> Self {
        Self::with_keypair(id, LongTermKeyPair::generate())
    }

    pub fn with_keypair(id: &str, keypair: LongTermKeyPair) -> Self {
        Self {
            id: id.to_string(),
            keypair,
            ephemeral: EphemeralKeyPair::generate(),
            shared: None,
        }
    }

    pub fn record(&self, admin: bool) -> PairingRecord {
        PairingRecord::new(self.id.clone(), self.keypair.public_key(), admin)
    }

    pub fn m1(&self) -> Vec<u8> {
        Tlv8::new()
            .with(TlvType::State, [1])
            .with(TlvType::PublicKey, self.ephemeral.public_key())
            .encode()
    }

    /// Check M2 against `accessory_ltpk` and build M3.
    pub fn m3(&mut self, m2: &Tlv8, accessory_ltpk: &[u8; 32]) -> Vec<u8> {
        let accessory_eph = m2.get(TlvType::PublicKey).unwrap().to_vec();
        let shared = self.ephemeral.diffie_hellman(&accessory_eph).unwrap();
        let key = hkdf::derive_pair_verify_key(&shared).unwrap();

        let plaintext = decrypt_with_nonce(
            &key,
            &nonce_from_string(b"PV-Msg02"),
            m2.get(TlvType::EncryptedData).unwrap(),
        )
        .unwrap();
        let sub = Tlv8::parse(&plaintext).unwrap();
        let mut info = accessory_eph.clone();
        info.extend_from_slice(sub.get(TlvType::Identifier).unwrap());
        info.extend_from_slice(&self.ephemeral.public_key());
        ed25519::verify(accessory_ltpk, &info, sub.get(TlvType::Signature).unwrap()).unwrap();

        let mut info = self.ephemeral.public_key().to_vec();
        info.extend_from_slice(self.id.as_bytes());
        info.extend_from_slice(&accessory_eph);
        let sub = Tlv8::new()
            .with(TlvType::Identifier, self.id.as_bytes())
            .with(TlvType::Signature, self.keypair.sign(&info));
        let sealed = encrypt_with_nonce(&key, &nonce_from_string(b"PV-Msg03"), &sub.encode()).unwrap();

        self.shared = Some(shared);
        Tlv8::new()
            .with(TlvType::State, [3])
            .with(TlvType::EncryptedData, sealed)
            .encode()
    }

    pub fn session_keys(&self) -> SessionKeys {
        SessionKeys::derive_controller_keys(&self.shared.unwrap()).unwrap()
    }
}
