//! Per-connection worker.
//!
//! One task owns the stream, its security session, the request reader and
//! whichever pairing handshake is in flight. Pairing endpoints are answered
//! here; everything else goes to the [`RequestHandler`] once the session is
//! established.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hap_core::error::{Error, ErrorKind, Result};
use hap_core::AccessoryConfig;
use hap_crypto::Tlv8;
use hap_pairing::{
    handle_pairings, PairSetup, PairVerify, PairingContext, PairingRecord, PairingStore,
    PairingsOutcome, SetupOutcome, VerifyOutcome,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, watch};

use crate::http::{self, Request, Response, CONTENT_TYPE_PAIRING_TLV8};
use crate::ota::FirmwareSink;
use crate::reader::{FramedReader, ReaderConfig};
use crate::session::SecuritySession;

pub const PAIR_SETUP_PATH: &str = "/pair-setup";
pub const PAIR_VERIFY_PATH: &str = "/pair-verify";
pub const PAIRINGS_PATH: &str = "/pairings";

/// Status for requests that need a verified session.
pub const STATUS_CONNECTION_AUTHORIZATION_REQUIRED: u16 = 470;

const EVENT_QUEUE_DEPTH: usize = 16;

/// Application requests arriving over a verified session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// `events` pushes unsolicited messages to this connection's controller.
    async fn handle(&self, request: Request, events: EventSender) -> Result<Response>;
}

/// Queues event payloads for a connection.
///
/// Events are written while the connection is idle between requests, and
/// dropped if the session is not established by then.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl EventSender {
    /// A sender and the queue it feeds.
    pub fn channel() -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        (Self { tx }, rx)
    }

    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.tx
            .send(payload.into())
            .await
            .map_err(|_| Error::closed("connection ended"))
    }

    pub fn try_send(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.tx.try_send(payload.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::NoMemory(format!("event queue of {} is full", EVENT_QUEUE_DEPTH))
            }
            mpsc::error::TrySendError::Closed(_) => Error::closed("connection ended"),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Everything a connection needs from the accessory. Cheap to clone.
#[derive(Clone)]
pub struct AccessoryServices {
    pub pairing: PairingContext,
    pub handler: Arc<dyn RequestHandler>,
    pub firmware: Option<Arc<dyn FirmwareSink>>,
    pub reader: ReaderConfig,
    pub read_timeout: Duration,
    paired: Arc<watch::Sender<bool>>,
}

impl AccessoryServices {
    pub async fn new(
        config: &AccessoryConfig,
        pairing: PairingContext,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self> {
        let paired = pairing.store.len().await? > 0;
        Ok(Self {
            pairing,
            handler,
            firmware: None,
            reader: ReaderConfig::from(config),
            read_timeout: config.read_timeout(),
            paired: Arc::new(watch::channel(paired).0),
        })
    }

    pub fn with_firmware_sink(mut self, sink: Arc<dyn FirmwareSink>) -> Self {
        self.firmware = Some(sink);
        self
    }

    /// Whether at least one controller is paired, updated as pairings change.
    pub fn subscribe_paired(&self) -> watch::Receiver<bool> {
        self.paired.subscribe()
    }

    async fn refresh_paired(&self) {
        match self.pairing.store.len().await {
            Ok(n) => {
                self.paired.send_if_modified(|paired| {
                    let changed = *paired != (n > 0);
                    *paired = n > 0;
                    changed
                });
            }
            Err(e) => tracing::warn!(error = %e, "Could not count pairings"),
        }
    }
}

/// Handshake in flight on this connection, at most one at a time.
#[derive(Default)]
enum Handshake {
    #[default]
    Idle,
    Setup(PairSetup),
    Verify(PairVerify),
}

enum Wake {
    Readable,
    Event(Vec<u8>),
    Closed,
}

enum Flow {
    Continue,
    Close,
}

pub struct Connection<S> {
    stream: BufReader<S>,
    session: SecuritySession,
    reader: FramedReader,
    handshake: Handshake,
    /// Controller the session was verified against.
    controller: Option<PairingRecord>,
    services: AccessoryServices,
    events: EventSender,
    event_rx: mpsc::Receiver<Vec<u8>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, services: AccessoryServices) -> Self {
        let (events, event_rx) = EventSender::channel();
        Self {
            stream: BufReader::new(stream),
            session: SecuritySession::new(services.read_timeout),
            reader: FramedReader::new(services.reader.clone(), services.firmware.clone()),
            handshake: Handshake::Idle,
            controller: None,
            services,
            events,
            event_rx,
        }
    }

    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Serve requests until the peer closes or a fatal error occurs.
    pub async fn run(mut self) -> Result<()> {
        loop {
            if !self.reader.has_buffered() && self.session.pending_len() == 0 {
                match self.idle().await? {
                    Wake::Closed => {
                        tracing::debug!("Peer closed the connection");
                        return Ok(());
                    }
                    Wake::Event(payload) => {
                        self.push_event(&payload).await?;
                        continue;
                    }
                    Wake::Readable => {}
                }
            }

            let request = match self
                .reader
                .read_request(&mut self.session, &mut self.stream)
                .await
            {
                Ok(request) => request,
                Err(Error::NotEstablished) => {
                    // firmware upload on an unverified session; its body is unread
                    self.respond(&Response::empty(STATUS_CONNECTION_AUTHORIZATION_REQUIRED))
                        .await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            if let Flow::Close = self.dispatch(request).await? {
                return Ok(());
            }
        }
    }

    /// Wait for the next request or a queued event. Consumes no stream bytes.
    async fn idle(&mut self) -> Result<Wake> {
        tokio::select! {
            biased;
            Some(payload) = self.event_rx.recv() => Ok(Wake::Event(payload)),
            ready = self.stream.fill_buf() => match ready {
                Ok([]) => Ok(Wake::Closed),
                Ok(_) => Ok(Wake::Readable),
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn push_event(&mut self, payload: &[u8]) -> Result<()> {
        match http::send_event(&mut self.session, self.stream.get_mut(), payload).await {
            Err(Error::NotEstablished) => {
                tracing::debug!(len = payload.len(), "Dropping event for unverified session");
                Ok(())
            }
            other => other,
        }
    }

    async fn dispatch(&mut self, request: Request) -> Result<Flow> {
        match request.path() {
            PAIR_SETUP_PATH => self.pair_setup(request.bytes()).await,
            PAIR_VERIFY_PATH => self.pair_verify(request.bytes()).await,
            PAIRINGS_PATH => self.pairings(request.bytes()).await,
            path if !self.session.is_established() => {
                tracing::debug!(%path, "Request before pair-verify");
                self.respond(&Response::empty(STATUS_CONNECTION_AUTHORIZATION_REQUIRED))
                    .await?;
                Ok(Flow::Continue)
            }
            _ => self.forward(request).await,
        }
    }

    async fn pair_setup(&mut self, body: &[u8]) -> Result<Flow> {
        let mut engine = match std::mem::take(&mut self.handshake) {
            Handshake::Setup(engine) => engine,
            _ => PairSetup::new(),
        };

        let step = engine.handle(&self.services.pairing, body).await;
        self.send_tlv(&step.response).await?;

        match step.outcome {
            SetupOutcome::InProgress => {
                self.handshake = Handshake::Setup(engine);
                Ok(Flow::Continue)
            }
            SetupOutcome::Paired(_) => {
                self.services.refresh_paired().await;
                Ok(Flow::Continue)
            }
            SetupOutcome::Failed(e) if e.kind() == ErrorKind::StorageFull => Ok(Flow::Continue),
            SetupOutcome::Failed(e) => {
                tracing::info!(error = %e, "Closing after failed pair-setup");
                Ok(Flow::Close)
            }
        }
    }

    async fn pair_verify(&mut self, body: &[u8]) -> Result<Flow> {
        let request_state = Tlv8::parse(body).ok().and_then(|t| t.state());
        if self.session.is_established() {
            let reply = Tlv8::error_reply(
                request_state.map_or(2, |s| s.saturating_add(1)),
                hap_core::error::tlv_codes::UNKNOWN,
            );
            tracing::warn!("Pair-verify on an established session");
            self.send_tlv(&reply).await?;
            return Ok(Flow::Continue);
        }

        // M1 always starts a fresh handshake
        let mut engine = match std::mem::take(&mut self.handshake) {
            Handshake::Verify(engine) if request_state != Some(1) => engine,
            _ => PairVerify::new(),
        };

        let step = engine.handle(&self.services.pairing, body).await;
        self.send_tlv(&step.response).await?;

        match step.outcome {
            VerifyOutcome::InProgress => {
                self.handshake = Handshake::Verify(engine);
                Ok(Flow::Continue)
            }
            VerifyOutcome::Verified { keys, controller } => {
                // M4 went out in plaintext; everything after is encrypted
                self.session.install_keys(keys)?;
                tracing::info!(controller = %controller.identifier, "Session verified");
                self.controller = Some(controller);
                Ok(Flow::Continue)
            }
            VerifyOutcome::Failed(e) => {
                tracing::info!(error = %e, "Closing after failed pair-verify");
                Ok(Flow::Close)
            }
        }
    }

    async fn pairings(&mut self, body: &[u8]) -> Result<Flow> {
        let step = handle_pairings(&self.services.pairing, self.controller.as_ref(), body).await;
        self.send_tlv(&step.response).await?;

        match step.outcome {
            PairingsOutcome::Added(_) => {
                self.services.refresh_paired().await;
                Ok(Flow::Continue)
            }
            PairingsOutcome::Removed { own, .. } => {
                self.services.refresh_paired().await;
                if own {
                    tracing::info!("Controller removed its own pairing, closing");
                    Ok(Flow::Close)
                } else {
                    Ok(Flow::Continue)
                }
            }
            PairingsOutcome::Failed(_) => Ok(Flow::Continue),
        }
    }

    async fn forward(&mut self, request: Request) -> Result<Flow> {
        let response = match self
            .services
            .handler
            .handle(request, self.events.clone())
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_fatal_to_connection() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Request handler failed");
                Response::empty(500)
            }
        };
        self.respond(&response).await?;
        Ok(Flow::Continue)
    }

    async fn send_tlv(&mut self, tlv: &Tlv8) -> Result<()> {
        http::send_response(
            &mut self.session,
            self.stream.get_mut(),
            200,
            CONTENT_TYPE_PAIRING_TLV8,
            &tlv.encode(),
        )
        .await
    }

    async fn respond(&mut self, response: &Response) -> Result<()> {
        http::send_response(
            &mut self.session,
            self.stream.get_mut(),
            response.status,
            &response.content_type,
            &response.body,
        )
        .await
    }
}
