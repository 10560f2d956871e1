//! A controller that speaks the pairing protocols, for driving a
//! [`Connection`](hap_transport::Connection) end to end.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hap_core::error::Result;
use hap_core::AccessoryConfig;
use hap_crypto::{
    chacha::{decrypt_with_nonce, encrypt_with_nonce, nonce_from_string},
    ed25519, hkdf,
    srp::{SrpChallenge, SrpClient, PAIR_SETUP_USERNAME},
    tlv::methods,
    EphemeralKeyPair, LongTermKeyPair, SessionKeys, Tlv8, TlvType,
};
use hap_pairing::{AccessoryIdentity, MemoryPairingStore, PairingContext, SetupSecret};
use hap_transport::{
    AccessoryServices, Connection, EventSender, FirmwareSink, Request, RequestHandler, Response,
    SecuritySession,
};
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

pub const CODE: &str = "031-45-154";

/// Records requests and keeps the latest event sender.
#[derive(Default)]
pub struct RecordingHandler {
    pub requests: Mutex<Vec<Request>>,
    pub events: Mutex<Option<EventSender>>,
}

#[async_trait]
impl RequestHandler for RecordingHandler {
    async fn handle(&self, request: Request, events: EventSender) -> Result<Response> {
        let body = format!("{{\"path\":\"{}\"}}", request.path());
        self.requests.lock().unwrap().push(request);
        *self.events.lock().unwrap() = Some(events);
        Ok(Response::json(200, body))
    }
}

/// Counts sink writes and keeps the image in memory.
#[derive(Default)]
pub struct MemorySink {
    pub writes: Mutex<Vec<usize>>,
    pub image: Mutex<Vec<u8>>,
}

#[async_trait]
impl FirmwareSink for MemorySink {
    async fn write(&self, cursor: &mut u32, data: &[u8]) -> Result<()> {
        let mut image = self.image.lock().unwrap();
        assert_eq!(*cursor as usize, image.len());
        image.extend_from_slice(data);
        self.writes.lock().unwrap().push(data.len());
        *cursor += data.len() as u32;
        Ok(())
    }
}

pub struct Accessory {
    pub pairing: PairingContext,
    pub handler: Arc<RecordingHandler>,
    pub sink: Arc<MemorySink>,
    pub services: AccessoryServices,
}

impl Accessory {
    pub async fn new(config: AccessoryConfig) -> Self {
        let pairing = PairingContext::new(
            AccessoryIdentity::generate(),
            SetupSecret::code(CODE),
            Arc::new(MemoryPairingStore::new(config.max_pairings)),
        );
        let handler = Arc::new(RecordingHandler::default());
        let sink = Arc::new(MemorySink::default());
        let services = AccessoryServices::new(&config, pairing.clone(), handler.clone())
            .await
            .unwrap()
            .with_firmware_sink(sink.clone());
        Self {
            pairing,
            handler,
            sink,
            services,
        }
    }

    /// Spawn a connection and return the controller end.
    pub fn connect(&self, id: &str) -> (TestController, JoinHandle<Result<()>>) {
        let (server, client) = duplex(64 * 1024);
        let task = tokio::spawn(Connection::new(server, self.services.clone()).run());
        (TestController::new(client, id, LongTermKeyPair::generate()), task)
    }

    pub fn ltpk(&self) -> [u8; 32] {
        self.pairing.identity.public_key()
    }
}

/// A parsed response or event.
#[derive(Debug)]
pub struct Message {
    pub status_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn tlv(&self) -> Tlv8 {
        Tlv8::parse(&self.body).unwrap()
    }
}

pub struct TestController {
    pub stream: DuplexStream,
    pub session: SecuritySession,
    pub id: String,
    pub keypair: LongTermKeyPair,
    carry: Vec<u8>,
}

impl TestController {
    pub fn new(stream: DuplexStream, id: &str, keypair: LongTermKeyPair) -> Self {
        Self {
            stream,
            session: SecuritySession::new(Duration::from_secs(5)),
            id: id.to_string(),
            keypair,
            carry: Vec::new(),
        }
    }

    pub async fn send_request(&mut self, method: &str, path: &str, content_type: &str, body: &[u8]) {
        let mut wire = format!(
            "{} {} HTTP/1.1\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            method,
            path,
            content_type,
            body.len()
        )
        .into_bytes();
        wire.extend_from_slice(body);
        self.session.send(&mut self.stream, &wire).await.unwrap();
    }

    pub async fn request(&mut self, method: &str, path: &str, content_type: &str, body: &[u8]) -> Message {
        self.send_request(method, path, content_type, body).await;
        self.read_message().await.unwrap()
    }

    pub async fn post_tlv(&mut self, path: &str, tlv: &Tlv8) -> Tlv8 {
        self.request("POST", path, "application/pairing+tlv8", &tlv.encode())
            .await
            .tlv()
    }

    /// Next response or event, `None` once the accessory closed the stream.
    pub async fn read_message(&mut self) -> Option<Message> {
        let mut buf = std::mem::take(&mut self.carry);
        let mut chunk = [0u8; 2048];
        let end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos;
            }
            match self.session.receive(&mut self.stream, &mut chunk).await {
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(_) => return None,
            }
        };

        let head = String::from_utf8(buf[..end].to_vec()).unwrap();
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap().to_string();
        let headers: Vec<(String, String)> = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        let len = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
            .map(|(_, v)| v.parse::<usize>().unwrap())
            .unwrap_or(0);

        let mut rest = buf.split_off(end + 4);
        while rest.len() < len {
            let n = self.session.receive(&mut self.stream, &mut chunk).await.ok()?;
            rest.extend_from_slice(&chunk[..n]);
        }
        self.carry = rest.split_off(len);
        Some(Message {
            status_line,
            headers,
            body: rest,
        })
    }

    /// Run M1-M6. Returns the final TLV (M6 or an error reply).
    pub async fn pair_setup(&mut self, code: &str) -> Tlv8 {
        let srp = SrpClient::new(PAIR_SETUP_USERNAME, code.as_bytes());

        let m2 = self
            .post_tlv(
                "/pair-setup",
                &Tlv8::new()
                    .with(TlvType::State, [1])
                    .with(TlvType::Method, [methods::PAIR_SETUP]),
            )
            .await;
        let proof = srp
            .process_challenge(&SrpChallenge {
                salt: m2.get(TlvType::Salt).unwrap().try_into().unwrap(),
                server_public_key: m2.get(TlvType::PublicKey).unwrap().to_vec(),
            })
            .unwrap();

        let m4 = self
            .post_tlv(
                "/pair-setup",
                &Tlv8::new()
                    .with(TlvType::State, [3])
                    .with(TlvType::PublicKey, srp.public_key())
                    .with(TlvType::Proof, proof.client_proof.clone()),
            )
            .await;
        if m4.error().is_some() {
            return m4;
        }
        assert!(srp.verify_server_proof(m4.get(TlvType::Proof).unwrap(), &proof.expected_server_proof));

        let setup_key = hkdf::derive_pair_setup_key(&proof.shared_secret).unwrap();
        let mut info = hkdf::derive_controller_sign_key(&proof.shared_secret)
            .unwrap()
            .to_vec();
        info.extend_from_slice(self.id.as_bytes());
        info.extend_from_slice(&self.keypair.public_key());
        let sub = Tlv8::new()
            .with(TlvType::Identifier, self.id.as_bytes())
            .with(TlvType::PublicKey, self.keypair.public_key())
            .with(TlvType::Signature, self.keypair.sign(&info));
        let sealed = encrypt_with_nonce(&setup_key, &nonce_from_string(b"PS-Msg05"), &sub.encode()).unwrap();

        self.post_tlv(
            "/pair-setup",
            &Tlv8::new()
                .with(TlvType::State, [5])
                .with(TlvType::EncryptedData, sealed),
        )
        .await
    }

    /// Run M1-M4 against `accessory_ltpk`, installing session keys on success.
    /// Returns M4.
    pub async fn pair_verify(&mut self, accessory_ltpk: &[u8; 32]) -> Tlv8 {
        let ephemeral = EphemeralKeyPair::generate();
        let m2 = self
            .post_tlv(
                "/pair-verify",
                &Tlv8::new()
                    .with(TlvType::State, [1])
                    .with(TlvType::PublicKey, ephemeral.public_key()),
            )
            .await;

        let accessory_eph = m2.get(TlvType::PublicKey).unwrap().to_vec();
        let shared = ephemeral.diffie_hellman(&accessory_eph).unwrap();
        let key = hkdf::derive_pair_verify_key(&shared).unwrap();
        let inner = decrypt_with_nonce(
            &key,
            &nonce_from_string(b"PV-Msg02"),
            m2.get(TlvType::EncryptedData).unwrap(),
        )
        .unwrap();
        let inner = Tlv8::parse(&inner).unwrap();
        let mut info = accessory_eph.clone();
        info.extend_from_slice(inner.get(TlvType::Identifier).unwrap());
        info.extend_from_slice(&ephemeral.public_key());
        ed25519::verify(accessory_ltpk, &info, inner.get(TlvType::Signature).unwrap()).unwrap();

        let mut info = ephemeral.public_key().to_vec();
        info.extend_from_slice(self.id.as_bytes());
        info.extend_from_slice(&accessory_eph);
        let sub = Tlv8::new()
            .with(TlvType::Identifier, self.id.as_bytes())
            .with(TlvType::Signature, self.keypair.sign(&info));
        let sealed = encrypt_with_nonce(&key, &nonce_from_string(b"PV-Msg03"), &sub.encode()).unwrap();

        let m4 = self
            .post_tlv(
                "/pair-verify",
                &Tlv8::new()
                    .with(TlvType::State, [3])
                    .with(TlvType::EncryptedData, sealed),
            )
            .await;
        if m4.error().is_none() {
            self.session
                .install_keys(SessionKeys::derive_controller_keys(&shared).unwrap())
                .unwrap();
        }
        m4
    }

    /// Write already-framed bytes one at a time.
    pub async fn trickle(&mut self, wire: &[u8]) {
        for byte in wire {
            self.stream.write_all(&[*byte]).await.unwrap();
            tokio::task::yield_now().await;
        }
    }
}
