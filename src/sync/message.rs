//! Wire format of cross-server sync messages
//!
//! A frame is three length-prefixed UTF-8 strings: namespace, opcode and
//! payload. Each length is a big-endian `u16` byte count. Frames whose
//! namespace is not [`NAMESPACE`] belong to other users of the shared relay
//! and decode to `None`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::types::{Economable, RelayError};

/// Namespace carried by every frame this ledger sends
pub const NAMESPACE: &str = "SaneEconomy";

/// Opcode asking the receiver to reload one player's account
pub const SYNC_PLAYER: &str = "SyncPlayer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMessage {
    /// The player's balance changed on the sender; reload it from storage
    SyncPlayer(Uuid),
}

impl RelayMessage {
    pub fn opcode(&self) -> &'static str {
        match self {
            RelayMessage::SyncPlayer(_) => SYNC_PLAYER,
        }
    }

    /// Account this message refers to
    pub fn economable(&self) -> Economable {
        match self {
            RelayMessage::SyncPlayer(uuid) => Economable::player(*uuid),
        }
    }

    pub fn encode(&self) -> Result<Bytes, RelayError> {
        let payload = match self {
            RelayMessage::SyncPlayer(uuid) => uuid.to_string(),
        };

        let fields = [NAMESPACE, self.opcode(), payload.as_str()];
        let mut frame = BytesMut::with_capacity(fields.iter().map(|f| f.len() + 2).sum());
        for field in fields {
            put_string(&mut frame, field)?;
        }
        Ok(frame.freeze())
    }

    /// Decode a frame read from the relay
    ///
    /// # Returns
    ///
    /// * `Ok(Some(message))` - A frame for this ledger
    /// * `Ok(None)` - A frame in another namespace
    /// * `Err(RelayError)` - Truncated or invalid frame, or an opcode this
    ///   version does not know
    pub fn decode(mut frame: &[u8]) -> Result<Option<Self>, RelayError> {
        let namespace = get_string(&mut frame)?;
        if namespace != NAMESPACE {
            return Ok(None);
        }

        let opcode = get_string(&mut frame)?;
        match opcode.as_str() {
            SYNC_PLAYER => {
                let payload = get_string(&mut frame)?;
                let uuid = Uuid::parse_str(&payload).map_err(|_| {
                    RelayError::malformed(format!("'{}' is not a player uuid", payload))
                })?;
                Ok(Some(RelayMessage::SyncPlayer(uuid)))
            }
            _ => Err(RelayError::UnknownOpcode { opcode }),
        }
    }
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), RelayError> {
    let len = u16::try_from(value.len()).map_err(|_| RelayError::StringTooLong { len: value.len() })?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_string(buf: &mut &[u8]) -> Result<String, RelayError> {
    if buf.remaining() < 2 {
        return Err(RelayError::malformed("missing string length"));
    }
    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return Err(RelayError::malformed(format!(
            "string of {} bytes truncated to {}",
            len,
            buf.remaining()
        )));
    }

    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| RelayError::malformed("string is not valid UTF-8"))
}
