//! Asynchronous notification records
//!
//! The process server reports page faults, content-initialisation requests
//! and client deaths to a server by appending fixed-size records to the
//! server's notification ring and then signalling its asynchronous endpoint.
//! Each record is nine machine words: a magic number, a label, and seven
//! label-specific arguments.

use core::mem::size_of;

use super::{SharedRegion, ShareWriter};
use crate::error::{SrvError, SrvResult};
use crate::types::{DeathId, Word};

/// Magic word at the start of every notification record
pub const NOTIFICATION_MAGIC: Word = 0xB0BA_11CE;

/// Number of argument words per record
pub const NOTIFICATION_ARGS: usize = 7;

/// Encoded record size in bytes
pub const NOTIFICATION_SIZE: usize = (2 + NOTIFICATION_ARGS) * size_of::<Word>();

// ============================================================================
// Raw record
// ============================================================================

/// Notification label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum NotifyKind {
    /// A client faulted on a window this server backs
    FaultDelegation = 0,
    /// A dataspace page needs its initial content
    ContentInit = 1,
    /// A watched client died
    Death = 2,
}

impl NotifyKind {
    /// Decode a label word
    pub fn from_label(label: Word) -> Option<Self> {
        match label {
            0 => Some(NotifyKind::FaultDelegation),
            1 => Some(NotifyKind::ContentInit),
            2 => Some(NotifyKind::Death),
            _ => None,
        }
    }
}

/// A raw notification record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub magic: Word,
    pub label: Word,
    pub arg: [Word; NOTIFICATION_ARGS],
}

impl Notification {
    /// Build a record with the correct magic
    pub fn new(kind: NotifyKind, arg: [Word; NOTIFICATION_ARGS]) -> Self {
        Self {
            magic: NOTIFICATION_MAGIC,
            label: kind as Word,
            arg,
        }
    }

    /// Encode as native-endian words
    pub fn to_bytes(&self) -> [u8; NOTIFICATION_SIZE] {
        let mut out = [0u8; NOTIFICATION_SIZE];
        let words = core::iter::once(self.magic)
            .chain(core::iter::once(self.label))
            .chain(self.arg.iter().copied());
        for (chunk, word) in out.chunks_exact_mut(size_of::<Word>()).zip(words) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        out
    }

    /// Decode native-endian words. Does not check the magic.
    pub fn from_bytes(bytes: &[u8; NOTIFICATION_SIZE]) -> Self {
        let mut words = [0 as Word; 2 + NOTIFICATION_ARGS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(size_of::<Word>())) {
            let mut buf = [0u8; size_of::<Word>()];
            buf.copy_from_slice(chunk);
            *word = Word::from_ne_bytes(buf);
        }
        let mut arg = [0 as Word; NOTIFICATION_ARGS];
        arg.copy_from_slice(&words[2..]);
        Self {
            magic: words[0],
            label: words[1],
            arg,
        }
    }

    /// Validate the magic and decode into a typed event
    pub fn event(&self) -> SrvResult<NotifyEvent> {
        if self.magic != NOTIFICATION_MAGIC {
            return Err(SrvError::Malformed);
        }
        let a = &self.arg;
        match NotifyKind::from_label(self.label).ok_or(SrvError::Malformed)? {
            NotifyKind::FaultDelegation => Ok(NotifyEvent::Fault(FaultNotice {
                window: a[0],
                window_size: a[1],
                fault_addr: a[2],
                window_offset: a[3],
                instruction: a[4] != 0,
                permission: a[5],
                pc: a[6],
            })),
            NotifyKind::ContentInit => Ok(NotifyEvent::ContentInit(ContentInitNotice {
                dataspace_id: a[0],
                dataspace_offset: a[1],
                window_offset: a[2],
            })),
            NotifyKind::Death => Ok(NotifyEvent::Death(DeathNotice {
                death_id: DeathId(a[0]),
            })),
        }
    }
}

// ============================================================================
// Typed events
// ============================================================================

/// A client faulted inside a window backed by this server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultNotice {
    /// Window ID as assigned by the process server
    pub window: Word,
    pub window_size: Word,
    /// Faulting virtual address
    pub fault_addr: Word,
    /// Offset of the fault into the window
    pub window_offset: Word,
    /// Instruction fetch rather than data access
    pub instruction: bool,
    /// Access permission bits of the faulting access
    pub permission: Word,
    pub pc: Word,
}

/// Initial content is needed for part of a dataspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentInitNotice {
    pub dataspace_id: Word,
    pub dataspace_offset: Word,
    pub window_offset: Word,
}

/// A watched client died
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeathNotice {
    /// The correlation ID issued when the client was watched
    pub death_id: DeathId,
}

/// Decoded notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    Fault(FaultNotice),
    ContentInit(ContentInitNotice),
    Death(DeathNotice),
}

impl From<NotifyEvent> for Notification {
    fn from(event: NotifyEvent) -> Self {
        match event {
            NotifyEvent::Fault(f) => Notification::new(
                NotifyKind::FaultDelegation,
                [
                    f.window,
                    f.window_size,
                    f.fault_addr,
                    f.window_offset,
                    f.instruction as Word,
                    f.permission,
                    f.pc,
                ],
            ),
            NotifyEvent::ContentInit(c) => Notification::new(
                NotifyKind::ContentInit,
                [c.dataspace_id, c.dataspace_offset, c.window_offset, 0, 0, 0, 0],
            ),
            NotifyEvent::Death(d) => {
                Notification::new(NotifyKind::Death, [d.death_id.0, 0, 0, 0, 0, 0, 0])
            }
        }
    }
}

// ============================================================================
// Writer (process server side)
// ============================================================================

/// Posts notification records into a server's notification ring
#[derive(Debug, Clone)]
pub struct NotificationWriter {
    ring: ShareWriter,
}

impl NotificationWriter {
    /// Attach to a server's notification region
    pub fn new(region: SharedRegion) -> Self {
        Self {
            ring: ShareWriter::new(region),
        }
    }

    /// Append one record; `ResourceExhausted` if the ring is full
    pub fn post(&mut self, event: NotifyEvent) -> SrvResult<()> {
        self.post_record(&Notification::from(event))
    }

    /// Append a raw record as is
    pub fn post_record(&mut self, record: &Notification) -> SrvResult<()> {
        self.ring.write(&record.to_bytes())
    }

    /// Report a client death
    pub fn post_death(&mut self, death_id: DeathId) -> SrvResult<()> {
        self.post(NotifyEvent::Death(DeathNotice { death_id }))
    }

    /// Report a fault on a window
    pub fn post_fault(&mut self, notice: FaultNotice) -> SrvResult<()> {
        self.post(NotifyEvent::Fault(notice))
    }

    /// Request initial content for a dataspace page
    pub fn post_content_init(&mut self, notice: ContentInitNotice) -> SrvResult<()> {
        self.post(NotifyEvent::ContentInit(notice))
    }

    /// The region being written
    pub fn region(&self) -> &SharedRegion {
        self.ring.region()
    }
}
