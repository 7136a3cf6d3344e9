//! Wire codec: request/response framing and the packed-unsigned integer
//! encoding used for TLV parameter lengths (spec §4.1).
//!
//! A message is `request_id: u16` then `opcode: u8` then zero or more TLV
//! parameters, with no terminating sentinel — the transport's own framing
//! tells the codec where the message ends. A parameter is `paramId: u8` then
//! a packed `u32` length then that many payload bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CoreError;

/// Begin a remote user transaction.
pub const M_UT_BEGIN: u8 = 1;
/// Response to [`M_UT_BEGIN`].
pub const M_RESP_UT_BEGIN: u8 = 2;
/// Commit a remote user transaction.
pub const M_UT_COMMIT: u8 = 3;
/// Response to [`M_UT_COMMIT`].
pub const M_RESP_UT_COMMIT: u8 = 4;
/// Roll back a remote user transaction.
pub const M_UT_ROLLBACK: u8 = 5;
/// Response to [`M_UT_ROLLBACK`].
pub const M_RESP_UT_ROLLBACK: u8 = 6;

/// XA `prepare` on a subordinate branch.
pub const M_XA_PREPARE: u8 = 10;
/// Response to [`M_XA_PREPARE`].
pub const M_RESP_XA_PREPARE: u8 = 11;
/// XA `commit` on a subordinate branch.
pub const M_XA_COMMIT: u8 = 12;
/// Response to [`M_XA_COMMIT`].
pub const M_RESP_XA_COMMIT: u8 = 13;
/// XA `rollback` on a subordinate branch.
pub const M_XA_ROLLBACK: u8 = 14;
/// Response to [`M_XA_ROLLBACK`].
pub const M_RESP_XA_ROLLBACK: u8 = 15;
/// XA `forget` on a subordinate branch.
pub const M_XA_FORGET: u8 = 16;
/// Response to [`M_XA_FORGET`].
pub const M_RESP_XA_FORGET: u8 = 17;

/// Unsigned context id assigned by the peer when a transaction begins.
pub const P_TXN_CONTEXT: u8 = 1;
/// Unsigned peer-identity id; omitted on the wire when zero.
pub const P_SEC_CONTEXT: u8 = 2;
/// Unsigned timeout in seconds; omitted on the wire when zero.
pub const P_TXN_TIMEOUT: u8 = 3;
/// Peer threw `IllegalStateException`.
pub const P_UT_IS_EXC: u8 = 4;
/// Peer threw `SystemException`.
pub const P_UT_SYS_EXC: u8 = 5;
/// Peer rolled the transaction back.
pub const P_UT_RB_EXC: u8 = 6;
/// Peer reported a heuristic-mixed outcome.
pub const P_UT_HME_EXC: u8 = 7;
/// Peer reported a heuristic-rollback outcome.
pub const P_UT_HRE_EXC: u8 = 8;
/// Peer threw `SecurityException`.
pub const P_SEC_EXC: u8 = 9;
/// Serialised `Xid` carried with an XA verb.
pub const P_XA_XID: u8 = 10;
/// One-byte 0/1 flag marking a one-phase commit.
pub const P_XA_ONE_PHASE: u8 = 11;

/// Maximum number of bytes a packed `u32` may occupy.
const MAX_PACKED_LEN: usize = 5;

/// Encodes `value` as a 1-to-5-byte big-endian variable-length quantity: each
/// byte carries 7 bits of the value with the high bit set on every byte but
/// the last.
pub fn encode_packed_u32(value: u32, out: &mut BytesMut) {
    let mut groups: Vec<u8> = Vec::with_capacity(MAX_PACKED_LEN);
    let mut remaining = value;
    loop {
        let group = u8::try_from(remaining & 0x7f).unwrap_or(0);
        groups.push(group);
        remaining >>= 7;
        if remaining == 0 {
            break;
        }
    }
    let last = groups.len().saturating_sub(1);
    for (i, group) in groups.into_iter().rev().enumerate() {
        let continuation = if i == last { 0 } else { 0x80 };
        out.put_u8(group | continuation);
    }
}

/// Decodes a packed `u32` from the front of `buf`, advancing past the bytes
/// consumed.
///
/// # Errors
/// Returns [`CoreError::ProtocolError`] if the buffer runs out before a
/// terminating byte (high bit clear) is seen, or if more than
/// [`MAX_PACKED_LEN`] bytes would be required.
pub fn decode_packed_u32(buf: &mut Bytes) -> Result<u32, CoreError> {
    let mut value: u32 = 0;
    for i in 0..MAX_PACKED_LEN {
        if !buf.has_remaining() {
            return Err(CoreError::ProtocolError(
                "truncated packed u32".to_owned(),
            ));
        }
        let byte = buf.get_u8();
        value = (value << 7) | u32::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        if i == MAX_PACKED_LEN - 1 {
            return Err(CoreError::ProtocolError(
                "packed u32 longer than 5 bytes".to_owned(),
            ));
        }
    }
    unreachable!("loop always returns or errors within MAX_PACKED_LEN iterations")
}

/// A single TLV parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    /// The parameter's wire identifier.
    pub id: u8,
    /// The parameter's payload.
    pub data: Bytes,
}

impl Param {
    /// Build a parameter carrying an unsigned integer, big-endian, trimmed
    /// to its minimal non-zero-padded byte form is not required on this wire
    /// — values are always encoded as 4-byte big-endian integers.
    #[must_use]
    pub fn unsigned(id: u8, value: u32) -> Self {
        Self {
            id,
            data: Bytes::copy_from_slice(&value.to_be_bytes()),
        }
    }

    /// Build a zero-length marker parameter (used for boolean/error flags).
    #[must_use]
    pub const fn marker(id: u8) -> Self {
        Self {
            id,
            data: Bytes::new(),
        }
    }

    /// Decode this parameter's payload as a big-endian `u32`.
    ///
    /// # Errors
    /// Returns [`CoreError::ProtocolError`] if the payload isn't exactly 4
    /// bytes.
    pub fn as_unsigned(&self) -> Result<u32, CoreError> {
        let bytes: [u8; 4] = self.data.as_ref().try_into().map_err(|_| {
            CoreError::ProtocolError(format!("parameter {} is not a 4-byte integer", self.id))
        })?;
        Ok(u32::from_be_bytes(bytes))
    }
}

/// A decoded protocol message: a correlation id, an opcode, and its
/// parameters in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Correlates a response with the request that produced it.
    pub request_id: u16,
    /// The message's opcode.
    pub opcode: u8,
    /// Parameters in the order they appeared on the wire.
    pub params: Vec<Param>,
}

impl Message {
    /// Construct a new message with no parameters.
    #[must_use]
    pub const fn new(request_id: u16, opcode: u8) -> Self {
        Self {
            request_id,
            opcode,
            params: Vec::new(),
        }
    }

    /// Append a parameter, returning `self` for chaining.
    #[must_use]
    pub fn with_param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    /// Returns the first parameter with the given id, if present.
    #[must_use]
    pub fn param(&self, id: u8) -> Option<&Param> { self.params.iter().find(|p| p.id == id) }

    /// Encode this message to its wire representation.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u16(self.request_id);
        out.put_u8(self.opcode);
        for param in &self.params {
            out.put_u8(param.id);
            encode_packed_u32(
                u32::try_from(param.data.len()).unwrap_or(u32::MAX),
                &mut out,
            );
            out.put_slice(&param.data);
        }
        out.freeze()
    }

    /// Decode a message from a complete frame (the transport has already
    /// delimited it; there is no further sentinel to look for).
    ///
    /// # Errors
    /// Returns [`CoreError::ProtocolError`] if the frame is truncated or a
    /// parameter length runs past the end of the buffer.
    pub fn decode(frame: &[u8]) -> Result<Self, CoreError> {
        let mut buf = Bytes::copy_from_slice(frame);
        if buf.remaining() < 3 {
            return Err(CoreError::ProtocolError("frame too short for header".to_owned()));
        }
        let request_id = buf.get_u16();
        let opcode = buf.get_u8();
        let mut params = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < 1 {
                return Err(CoreError::ProtocolError("truncated parameter id".to_owned()));
            }
            let id = buf.get_u8();
            let len = usize::try_from(decode_packed_u32(&mut buf)?)
                .map_err(|_| CoreError::ProtocolError("parameter length exceeds usize range".to_owned()))?;
            if buf.remaining() < len {
                return Err(CoreError::ProtocolError(
                    "parameter length exceeds remaining frame".to_owned(),
                ));
            }
            let data = buf.copy_to_bytes(len);
            params.push(Param { id, data });
        }
        Ok(Self {
            request_id,
            opcode,
            params,
        })
    }
}
