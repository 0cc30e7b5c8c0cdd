//! Muen SHMSTREAM20: a single-producer/single-consumer shared-memory ring
//! with epoch-based reader resynchronization, used by the Muen backend for
//! console and net I/O.
//!
//! Grounded on `original_source/bindings/muen/reader.c` and `writer.h`. The
//! header is seven 64-bit little-endian fields; every access goes through a
//! volatile, single-word read/write (`serialized_copy` in the original) so
//! neither side ever observes a torn field — this is the one place in the
//! workspace where raw-pointer `unsafe` is load-bearing.

use std::sync::atomic::{fence, Ordering};

/// On-wire layout order per `spec.md` §6: transport, protocol, size,
/// elements, epoch, wc, wsc — 7 x u64 LE, no padding.
const HEADER_LEN: usize = 7 * 8;

const OFF_TRANSPORT: usize = 0;
const OFF_PROTOCOL: usize = 8;
const OFF_SIZE: usize = 16;
const OFF_ELEMENTS: usize = 24;
const OFF_EPOCH: usize = 32;
const OFF_WC: usize = 40;
const OFF_WSC: usize = 48;

/// Magic transport identifier for this protocol version.
pub const TRANSPORT_SHMSTREAM20: u64 = u64::from_le_bytes(*b"SHMSTR20");
/// Distinguished epoch value denoting an inactive channel.
pub const NULL_EPOCH: u64 = 0;

/// Single-word volatile read of a header field. `unsafe` because it reads
/// through a raw pointer derived from the backing slice; callers must
/// ensure `buf` is at least `HEADER_LEN` bytes and that `off` is 8-aligned
/// within it, both of which `Channel::new` enforces.
unsafe fn read_field(buf: &[u8], off: usize) -> u64 {
    let ptr = buf.as_ptr().add(off) as *const u64;
    std::ptr::read_volatile(ptr)
}

unsafe fn write_field(buf: &mut [u8], off: usize, val: u64) {
    let ptr = buf.as_mut_ptr().add(off) as *mut u64;
    std::ptr::write_volatile(ptr, val);
}

/// A view over a raw SHMSTREAM20 channel: a header followed by
/// `elements * size` bytes of payload.
pub struct Channel<'a> {
    buf: &'a mut [u8],
}

impl<'a> Channel<'a> {
    /// Wraps `buf` as a channel. Panics if `buf` is shorter than the header.
    pub fn new(buf: &'a mut [u8]) -> Self {
        assert!(buf.len() >= HEADER_LEN, "SHMSTREAM20 buffer too small for header");
        Channel { buf }
    }

    fn get(&self, off: usize) -> u64 {
        // SAFETY: `off` is one of the header field offsets below HEADER_LEN,
        // and `Channel::new` guaranteed `self.buf.len() >= HEADER_LEN`.
        unsafe { read_field(self.buf, off) }
    }

    fn set(&mut self, off: usize, val: u64) {
        // SAFETY: see `get`.
        unsafe { write_field(self.buf, off, val) }
    }

    pub fn transport(&self) -> u64 {
        self.get(OFF_TRANSPORT)
    }
    pub fn protocol(&self) -> u64 {
        self.get(OFF_PROTOCOL)
    }
    pub fn size(&self) -> u64 {
        self.get(OFF_SIZE)
    }
    pub fn elements(&self) -> u64 {
        self.get(OFF_ELEMENTS)
    }
    pub fn epoch(&self) -> u64 {
        self.get(OFF_EPOCH)
    }
    pub fn wc(&self) -> u64 {
        self.get(OFF_WC)
    }
    pub fn wsc(&self) -> u64 {
        self.get(OFF_WSC)
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[HEADER_LEN..]
    }

    fn payload(&self) -> &[u8] {
        &self.buf[HEADER_LEN..]
    }
}

/// The single producer side of a channel.
pub struct Writer<'a> {
    chan: Channel<'a>,
}

impl<'a> Writer<'a> {
    /// Initializes (or re-initializes) the channel, per `spec.md` §4.8:
    /// deactivate, zero, set static fields, then publish a fresh nonzero
    /// `epoch`. `epoch` must be nonzero — the caller picks it (e.g. a
    /// monotonic counter or a random value) since there is no clock
    /// available to this crate.
    pub fn init(buf: &'a mut [u8], protocol: u64, size: u64, elements: u64, epoch: u64) -> Self {
        assert_ne!(epoch, NULL_EPOCH, "writer epoch must be nonzero");
        let mut chan = Channel::new(buf);

        // 1. Deactivate.
        chan.set(OFF_EPOCH, NULL_EPOCH);
        // 2. Zero header (except transport/epoch, set explicitly below) and data.
        chan.set(OFF_WC, 0);
        chan.set(OFF_WSC, 0);
        chan.set(OFF_PROTOCOL, protocol);
        chan.set(OFF_SIZE, size);
        chan.set(OFF_ELEMENTS, elements);
        chan.set(OFF_TRANSPORT, TRANSPORT_SHMSTREAM20);
        for b in chan.payload_mut() {
            *b = 0;
        }
        fence(Ordering::Release);
        // 3. Publish epoch (activates the channel).
        chan.set(OFF_EPOCH, epoch);

        Writer { chan }
    }

    /// Writes one element, per the two-phase `wsc`/`wc` commit protocol.
    pub fn write_element(&mut self, data: &[u8]) {
        let size = self.chan.size() as usize;
        let elements = self.chan.elements();
        assert_eq!(data.len(), size, "element size mismatch");

        let wc = self.chan.wc();
        let next_wc = wc + 1;

        // 1. Mark write-in-progress before touching the slot.
        self.chan.set(OFF_WSC, next_wc);
        fence(Ordering::Release);

        // 2. Copy the element into its slot.
        let slot = (wc % elements) as usize;
        let off = slot * size;
        self.chan.payload_mut()[off..off + size].copy_from_slice(data);
        fence(Ordering::Release);

        // 3. Commit.
        self.chan.set(OFF_WC, next_wc);
    }
}

/// Outcome of a `Reader::read_element` call. `spec.md` §8 invariant 5: a
/// message whose payload was concurrently overwritten by a wraparound is
/// never reported as `Success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Success,
    NoData,
    EpochChanged,
    Incompatible,
    OverrunDetected,
    Inactive,
}

/// The single consumer side of a channel. Carries its own read cursor and a
/// cache of the header fields last seen at synchronization time.
pub struct Reader {
    epoch: u64,
    protocol: u64,
    size: u64,
    elements: u64,
    rc: u64,
}

impl Reader {
    pub fn new(protocol: u64) -> Self {
        Reader {
            epoch: NULL_EPOCH,
            protocol,
            size: 0,
            elements: 0,
            rc: 0,
        }
    }

    /// Reads the next pending element into `buf` (which must be exactly
    /// `size` bytes once the reader has synchronized). See `spec.md` §4.8
    /// for the numbered procedure this implements step for step.
    pub fn read_element(&mut self, chan: &Channel<'_>, buf: &mut [u8]) -> ReadStatus {
        // 1. Inactive channel: reset reader state and report it.
        if chan.epoch() == NULL_EPOCH {
            // Writing back NULL_EPOCH here (rather than leaving the reader's
            // last-known epoch in place) is intentional: it forces the next
            // read against a newly (re)activated channel to go through full
            // resynchronization rather than risk an extremely unlikely
            // epoch-wraparound collision with a stale cached value.
            self.epoch = NULL_EPOCH;
            return ReadStatus::Inactive;
        }

        // 2. Resynchronize if this is a fresh reader or the writer restarted.
        if self.epoch == NULL_EPOCH || chan.epoch() != self.epoch {
            if chan.protocol() == self.protocol && chan.transport() == TRANSPORT_SHMSTREAM20 {
                self.epoch = chan.epoch();
                self.size = chan.size();
                self.elements = chan.elements();
                self.rc = 0;
                return ReadStatus::EpochChanged;
            } else {
                return ReadStatus::Incompatible;
            }
        }

        // 3. No data pending.
        let wc = chan.wc();
        if wc == self.rc {
            return ReadStatus::NoData;
        }

        // 4. Consumer fell behind the window.
        if wc - self.rc > self.elements {
            return ReadStatus::OverrunDetected;
        }

        // 5. Copy the element out, then fence so step 6's re-read of wsc
        // cannot be reordered ahead of this copy.
        let slot = (self.rc % self.elements) as usize;
        let size = self.size as usize;
        let off = slot * size;
        buf[..size].copy_from_slice(&chan.payload()[off..off + size]);
        fence(Ordering::Acquire);

        // 6. Detect a writer wraparound that happened during our copy.
        let wsc = chan.wsc();
        if wsc - self.rc > self.elements {
            return ReadStatus::OverrunDetected;
        }

        // 7. Commit the read, then check once more for a writer restart.
        self.rc += 1;
        if chan.epoch() != self.epoch {
            return ReadStatus::EpochChanged;
        }
        ReadStatus::Success
    }

    /// Skips all pending elements without reading them.
    pub fn drain(&mut self, chan: &Channel<'_>) {
        self.rc = chan.wc();
    }

    /// Whether a subsequent `read_element` would find data, after
    /// resynchronizing if necessary.
    pub fn has_pending_data(&mut self, chan: &Channel<'_>) -> bool {
        if chan.epoch() == NULL_EPOCH {
            return false;
        }
        if self.epoch == NULL_EPOCH || chan.epoch() != self.epoch {
            if chan.protocol() == self.protocol && chan.transport() == TRANSPORT_SHMSTREAM20 {
                self.epoch = chan.epoch();
                self.size = chan.size();
                self.elements = chan.elements();
                self.rc = 0;
            } else {
                return false;
            }
        }
        chan.wc() > self.rc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_bytes(elements: u64, size: u64) -> Vec<u8> {
        vec![0u8; HEADER_LEN + (elements * size) as usize]
    }

    #[test]
    fn fresh_reader_on_inactive_channel_reports_inactive() {
        let mut buf = channel_bytes(4, 8);
        let chan = Channel::new(&mut buf);
        let mut reader = Reader::new(42);
        let mut out = [0u8; 8];
        assert_eq!(reader.read_element(&chan, &mut out), ReadStatus::Inactive);
    }

    #[test]
    fn first_read_after_init_synchronizes_then_delivers() {
        let mut buf = channel_bytes(4, 8);
        let mut writer = Writer::init(&mut buf, 42, 8, 4, 1);
        writer.write_element(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let chan = Channel::new(&mut buf);
        let mut reader = Reader::new(42);
        let mut out = [0u8; 8];
        assert_eq!(
            reader.read_element(&chan, &mut out),
            ReadStatus::EpochChanged
        );
        assert_eq!(
            reader.read_element(&chan, &mut out),
            ReadStatus::Success
        );
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(reader.read_element(&chan, &mut out), ReadStatus::NoData);
    }

    #[test]
    fn incompatible_protocol_is_rejected() {
        let mut buf = channel_bytes(4, 8);
        let _writer = Writer::init(&mut buf, 42, 8, 4, 1);
        let chan = Channel::new(&mut buf);
        let mut reader = Reader::new(99);
        let mut out = [0u8; 8];
        assert_eq!(
            reader.read_element(&chan, &mut out),
            ReadStatus::Incompatible
        );
    }

    #[test]
    fn overrun_detected_when_consumer_falls_behind() {
        let mut buf = channel_bytes(2, 4);
        let mut writer = Writer::init(&mut buf, 1, 4, 2, 1);
        let mut reader = Reader::new(1);
        let mut out = [0u8; 4];
        {
            let chan = Channel::new(&mut buf);
            assert_eq!(reader.read_element(&chan, &mut out), ReadStatus::EpochChanged);
        }
        // Write 3 elements into a 2-slot ring: the reader (rc=0) falls
        // behind by more than `elements`.
        writer.write_element(&[1; 4]);
        writer.write_element(&[2; 4]);
        writer.write_element(&[3; 4]);
        let chan = Channel::new(&mut buf);
        assert_eq!(
            reader.read_element(&chan, &mut out),
            ReadStatus::OverrunDetected
        );
    }

    #[test]
    fn drain_and_has_pending_data() {
        let mut buf = channel_bytes(4, 8);
        let mut writer = Writer::init(&mut buf, 7, 8, 4, 1);
        writer.write_element(&[0; 8]);
        let chan = Channel::new(&mut buf);
        let mut reader = Reader::new(7);
        assert!(reader.has_pending_data(&chan));
        reader.drain(&chan);
        assert!(!reader.has_pending_data(&chan));
    }
}
