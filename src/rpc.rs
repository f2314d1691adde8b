//! RPC messages and the serv connection protocol
//!
//! A [`Message`] is what the kernel hands a server on receive: a label, the
//! badge of the capability it arrived through, the capabilities transferred
//! with it, and a vector of payload words. Payload words are consumed with
//! [`Message::pop`] in the order the sender pushed them.
//!
//! The serv protocol is the small interface every server speaks on its
//! anonymous endpoint: connect, ping, set the parameter buffer, disconnect.

use alloc::vec::Vec;

use crate::error::{SrvError, SrvResult, EDELEGATED, ESUCCESS};
use crate::types::{Badge, CPtr, Word};

// ============================================================================
// Message
// ============================================================================

/// An RPC message as delivered by the kernel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Method label
    pub label: Word,
    /// Badge of the capability the message arrived through
    pub badge: Badge,
    /// Bit mask of transferred capabilities the kernel unwrapped to badges
    pub caps_unwrapped: usize,
    /// Capabilities transferred with the message
    pub caps: Vec<CPtr>,
    /// Payload words
    pub words: Vec<Word>,
    /// Read cursor into `words`
    pos: usize,
}

impl Message {
    /// Create an empty message with the given label
    pub fn new(label: Word) -> Self {
        Self {
            label,
            ..Self::default()
        }
    }

    /// Set the badge (builder style)
    pub fn with_badge(mut self, badge: Badge) -> Self {
        self.badge = badge;
        self
    }

    /// Attach a capability (builder style)
    pub fn with_cap(mut self, cap: CPtr) -> Self {
        self.caps.push(cap);
        self
    }

    /// Append a payload word (builder style)
    pub fn with_word(mut self, word: Word) -> Self {
        self.words.push(word);
        self
    }

    /// Number of extra capabilities transferred
    pub fn extra_caps(&self) -> usize {
        self.caps.len()
    }

    /// Append a payload word
    pub fn push(&mut self, word: Word) {
        self.words.push(word);
    }

    /// Append a signed payload word
    pub fn push_isize(&mut self, value: isize) {
        self.words.push(value as Word);
    }

    /// Consume the next payload word
    pub fn pop(&mut self) -> SrvResult<Word> {
        let word = *self.words.get(self.pos).ok_or(SrvError::Malformed)?;
        self.pos += 1;
        Ok(word)
    }

    /// Consume the next payload word as a signed value
    pub fn pop_isize(&mut self) -> SrvResult<isize> {
        self.pop().map(|w| w as isize)
    }

    /// Payload words not yet consumed
    pub fn remaining(&self) -> usize {
        self.words.len() - self.pos
    }

    /// Rewind the read cursor
    pub fn rewind(&mut self) {
        self.pos = 0;
    }
}

/// Verify the capability shape of a request.
///
/// `unwrapped_mask` must match exactly which transferred capabilities the
/// kernel unwrapped, and exactly `num_extra_caps` capabilities must be
/// attached.
pub fn check_dispatch_caps(msg: &Message, unwrapped_mask: usize, num_extra_caps: usize) -> bool {
    msg.caps_unwrapped == unwrapped_mask && msg.extra_caps() == num_extra_caps
}

// ============================================================================
// Dispatch result
// ============================================================================

/// Outcome of offering a message to one dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Dispatch {
    /// The dispatcher failed while handling the message
    Error = -2,
    /// Not for this dispatcher; try the next one
    Pass = -1,
    /// Handled
    Success = 0,
}

// ============================================================================
// Serv protocol
// ============================================================================

/// First label of the serv protocol
pub const SERV_METHODS_BASE: Word = 0x1400;
/// Connect with a liveness capability on the anonymous endpoint
pub const SERV_CONNECT_DIRECT: Word = SERV_METHODS_BASE;
/// Check the session is alive
pub const SERV_PING: Word = SERV_METHODS_BASE + 1;
/// Share a parameter buffer dataspace with the server
pub const SERV_SET_PARAM_BUFFER: Word = SERV_METHODS_BASE + 2;
/// Tear down the session
pub const SERV_DISCONNECT_DIRECT: Word = SERV_METHODS_BASE + 3;
/// One past the last serv protocol label
pub const SERV_LABEL_MAX: Word = SERV_METHODS_BASE + 4;

/// A decoded serv protocol request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServRequest {
    /// Connect, liveness capability attached
    ConnectDirect,
    /// Ping
    Ping,
    /// Set (size > 0, dataspace attached) or unset (size 0, nothing attached)
    SetParamBuffer { size: usize },
    /// Disconnect
    DisconnectDirect,
}

impl ServRequest {
    /// Whether a label belongs to the serv protocol
    pub fn is_serv_label(label: Word) -> bool {
        (SERV_METHODS_BASE..SERV_LABEL_MAX).contains(&label)
    }

    /// Decode a request, consuming its payload words.
    ///
    /// Returns `Ok(None)` for labels outside the serv protocol.
    pub fn decode(msg: &mut Message) -> SrvResult<Option<Self>> {
        let req = match msg.label {
            SERV_CONNECT_DIRECT => ServRequest::ConnectDirect,
            SERV_PING => ServRequest::Ping,
            SERV_SET_PARAM_BUFFER => ServRequest::SetParamBuffer { size: msg.pop()? },
            SERV_DISCONNECT_DIRECT => ServRequest::DisconnectDirect,
            _ => return Ok(None),
        };
        Ok(Some(req))
    }

    /// Encode as a request message
    pub fn encode(self) -> Message {
        match self {
            ServRequest::ConnectDirect => Message::new(SERV_CONNECT_DIRECT),
            ServRequest::Ping => Message::new(SERV_PING),
            ServRequest::SetParamBuffer { size } => {
                Message::new(SERV_SET_PARAM_BUFFER).with_word(size)
            }
            ServRequest::DisconnectDirect => Message::new(SERV_DISCONNECT_DIRECT),
        }
    }
}

/// Build a reply carrying a status word followed by `values`.
///
/// A `Kernel` error is sent as `EDELEGATED` followed by the kernel status.
pub fn reply_status(label: Word, status: SrvResult<()>, values: &[Word]) -> Message {
    let mut reply = Message::new(label);
    match status {
        Ok(()) => reply.push_isize(ESUCCESS),
        Err(SrvError::Kernel(code)) => {
            reply.push_isize(EDELEGATED);
            reply.push_isize(code as isize);
        }
        Err(e) => reply.push_isize(e.errno()),
    }
    for &v in values {
        reply.push(v);
    }
    reply
}

/// Read the status word at the front of a reply
pub fn reply_result(reply: &mut Message) -> SrvResult<()> {
    match reply.pop_isize()? {
        EDELEGATED => {
            let code = reply.pop_isize()?;
            Err(i32::try_from(code).map_or(SrvError::Malformed, SrvError::Kernel))
        }
        code => SrvError::from_errno(code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_pop_order() {
        let mut msg = Message::new(7).with_word(1).with_word(2);
        assert_eq!(msg.pop(), Ok(1));
        assert_eq!(msg.remaining(), 1);
        assert_eq!(msg.pop(), Ok(2));
        assert_eq!(msg.pop(), Err(SrvError::Malformed));
        msg.rewind();
        assert_eq!(msg.pop(), Ok(1));
    }

    #[test]
    fn test_check_dispatch_caps() {
        let msg = Message::new(0).with_cap(CPtr(9));
        assert!(check_dispatch_caps(&msg, 0, 1));
        assert!(!check_dispatch_caps(&msg, 0, 0));
        assert!(!check_dispatch_caps(&msg, 1, 1));
    }

    #[test]
    fn test_serv_request_decode() {
        let mut msg = ServRequest::SetParamBuffer { size: 0x2000 }.encode();
        assert_eq!(
            ServRequest::decode(&mut msg),
            Ok(Some(ServRequest::SetParamBuffer { size: 0x2000 }))
        );

        let mut short = Message::new(SERV_SET_PARAM_BUFFER);
        assert_eq!(ServRequest::decode(&mut short), Err(SrvError::Malformed));

        let mut other = Message::new(0x99);
        assert_eq!(ServRequest::decode(&mut other), Ok(None));
        assert!(!ServRequest::is_serv_label(0x99));
    }

    #[test]
    fn test_reply_status() {
        let mut ok = reply_status(0, Ok(()), &[42]);
        assert_eq!(reply_result(&mut ok), Ok(()));
        assert_eq!(ok.pop(), Ok(42));

        let mut err = reply_status(0, Err(SrvError::NotFound), &[]);
        assert_eq!(reply_result(&mut err), Err(SrvError::NotFound));
    }

    #[test]
    fn test_reply_carries_kernel_status() {
        for code in [-1, -42, 7] {
            let mut reply = reply_status(0, Err(SrvError::Kernel(code)), &[]);
            assert_eq!(reply_result(&mut reply), Err(SrvError::Kernel(code)));
            assert_eq!(reply.remaining(), 0);
        }

        let mut truncated = Message::new(0);
        truncated.push_isize(EDELEGATED);
        assert_eq!(reply_result(&mut truncated), Err(SrvError::Malformed));
    }
}
