//! Cross-server invalidation over an external relay
//!
//! Several servers may share one durable store while each keeps its own
//! account cache. Every transaction marks the players it touched as pending.
//! Once the write flusher has made a pending player's balance durable, this
//! adapter tells the other servers to reload that player, unless the player
//! has a session here; such a player is assumed to be cached authoritatively
//! on this server. Inbound invalidations force a reload from the store.
//!
//! Waiting for the write means a peer never reloads a balance older than the
//! one that triggered the invalidation. Several transactions on one player
//! between two flushes produce a single invalidation.
//!
//! Some relays can only send through a connected session (a "carrier"). When
//! the transport has none, outbound invalidations are skipped silently.

use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::{
    AccountStore, PersistListener, PresenceOracle, RelayTransport, TransactionSubscriber,
};
use crate::sync::message::RelayMessage;
use crate::types::{Account, Economable, RelayError, Transaction};

/// Transaction subscriber, persist listener and inbound handler for
/// cross-server sync
pub struct SyncRelayAdapter {
    store: Arc<AccountStore>,
    presence: Arc<dyn PresenceOracle>,
    transport: Arc<dyn RelayTransport>,
    /// Players changed by a transaction and not yet announced
    pending: Mutex<HashSet<Economable>>,
}

impl SyncRelayAdapter {
    pub fn new(
        store: Arc<AccountStore>,
        presence: Arc<dyn PresenceOracle>,
        transport: Arc<dyn RelayTransport>,
    ) -> Self {
        Self {
            store,
            presence,
            transport,
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Players waiting for their write before being announced
    pub fn pending(&self) -> usize {
        self.pending_set().len()
    }

    fn pending_set(&self) -> MutexGuard<'_, HashSet<Economable>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask other servers to reload `economable`
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - A frame was sent
    /// * `Ok(false)` - Nothing to send: not a player, the player is present
    ///   here, or the transport has no carrier
    pub fn invalidate(&self, economable: &Economable) -> Result<bool, RelayError> {
        let Some(uuid) = economable.player_uuid() else {
            return Ok(false);
        };
        if self.presence.is_present(economable) || !self.transport.has_carrier() {
            return Ok(false);
        }

        let frame = RelayMessage::SyncPlayer(uuid).encode()?;
        self.transport.send(frame)?;
        debug!(%economable, "sent sync invalidation");
        Ok(true)
    }

    /// Apply one inbound frame
    ///
    /// Frames from other namespaces are ignored. Malformed frames and unknown
    /// opcodes are logged and dropped. Reads the backend, so async callers
    /// should run it on the blocking pool.
    ///
    /// # Returns
    ///
    /// The reloaded account, or `None` if nothing was reloaded
    pub fn handle_frame(&self, frame: &[u8]) -> Option<Account> {
        let message = match RelayMessage::decode(frame) {
            Ok(Some(message)) => message,
            Ok(None) => return None,
            Err(error) => {
                warn!(%error, "dropping relay message");
                return None;
            }
        };

        let economable = message.economable();
        match self.store.force_reload(&economable) {
            Ok(account) => account,
            Err(error) => {
                warn!(%economable, %error, "sync reload failed, keeping cached balance");
                None
            }
        }
    }

    /// Feed every frame from `inbound` into [`handle_frame`](Self::handle_frame)
    ///
    /// The task ends when the sending side of the channel is dropped.
    pub fn spawn_listener(self: &Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Bytes>) -> JoinHandle<()> {
        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                let handler = Arc::clone(&adapter);
                if let Err(e) = tokio::task::spawn_blocking(move || handler.handle_frame(&frame)).await {
                    warn!(error = %e, "relay handler task failed");
                }
            }
            debug!("relay listener stopped");
        })
    }
}

impl TransactionSubscriber for SyncRelayAdapter {
    fn on_transaction(&self, transaction: &Transaction) {
        let mut pending = self.pending_set();
        for economable in transaction.economables() {
            if economable.player_uuid().is_some() {
                pending.insert(economable.clone());
            }
        }
    }
}

impl PersistListener for SyncRelayAdapter {
    fn on_persisted(&self, economables: &[Economable]) {
        let announce: Vec<&Economable> = {
            let mut pending = self.pending_set();
            economables
                .iter()
                .filter(|economable| pending.remove(*economable))
                .collect()
        };

        for economable in announce {
            if let Err(error) = self.invalidate(economable) {
                warn!(%economable, %error, "failed to send sync invalidation");
            }
        }
    }
}

/// Relay transport backed by an in-process channel
///
/// Hands frames to whatever drains the receiver, typically another ledger's
/// relay listener or a bridge to the real relay.
#[derive(Debug)]
pub struct ChannelRelay {
    outbound: mpsc::UnboundedSender<Bytes>,
    carrier: AtomicBool,
}

impl ChannelRelay {
    /// A transport with a carrier, and the receiver of everything it sends
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (outbound, inbound) = mpsc::unbounded_channel();
        (
            ChannelRelay {
                outbound,
                carrier: AtomicBool::new(true),
            },
            inbound,
        )
    }

    pub fn set_carrier(&self, available: bool) {
        self.carrier.store(available, Ordering::SeqCst);
    }
}

impl RelayTransport for ChannelRelay {
    fn has_carrier(&self) -> bool {
        self.carrier.load(Ordering::SeqCst)
    }

    fn send(&self, frame: Bytes) -> Result<(), RelayError> {
        self.outbound
            .send(frame)
            .map_err(|_| RelayError::transport("relay channel closed"))
    }
}
