use crate::error::{Error, Result};
use crate::gio::Endpoint;
use log::{debug, warn};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

pub fn sum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

pub fn sum8_negated(bytes: &[u8]) -> u8 {
    sum8(bytes).wrapping_neg()
}

pub fn xor8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum ^ b)
}

/// What a length rule knows about the bytes accumulated so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Not enough header yet.
    More,
    /// Total packet length, markers included.
    Length(usize),
    /// The last byte cannot belong to this packet.
    Invalid,
    /// Unrecognized packet type.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

pub type LengthLookup = Arc<dyn Fn(&[u8]) -> Expect + Send + Sync>;

#[derive(Clone)]
pub enum LengthRule {
    Fixed(usize),
    /// Total is the field value plus `adjust`.
    Field {
        offset: usize,
        width: usize,
        order: ByteOrder,
        adjust: isize,
    },
    Lookup(LengthLookup),
}

impl fmt::Debug for LengthRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LengthRule::Fixed(n) => write!(f, "Fixed({})", n),
            LengthRule::Field {
                offset,
                width,
                order,
                adjust,
            } => write!(f, "Field({}+{} {:?} {:+})", offset, width, order, adjust),
            LengthRule::Lookup(_) => write!(f, "Lookup"),
        }
    }
}

impl LengthRule {
    fn expect(&self, packet: &[u8]) -> Expect {
        match self {
            LengthRule::Fixed(n) => Expect::Length(*n),
            LengthRule::Field {
                offset,
                width,
                order,
                adjust,
            } => {
                let field = match packet.get(*offset..offset + width) {
                    Some(field) => field,
                    None => return Expect::More,
                };
                let value = match order {
                    ByteOrder::Little => field.iter().rev().fold(0usize, |v, &b| v << 8 | b as usize),
                    ByteOrder::Big => field.iter().fold(0usize, |v, &b| v << 8 | b as usize),
                };
                match (value as isize).checked_add(*adjust) {
                    Some(total) if total >= (offset + width) as isize && total > 0 => {
                        Expect::Length(total as usize)
                    }
                    _ => Expect::Invalid,
                }
            }
            LengthRule::Lookup(lookup) => lookup(packet),
        }
    }
}

/// Checksum byte `position` bytes from the end, computed over the whole
/// packet with that byte zeroed.
#[derive(Debug, Clone, Copy)]
pub struct Checksum {
    pub position: usize,
    pub compute: fn(&[u8]) -> u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Mismatches are dropped and the stream resynchronized.
    Strict,
    /// Mismatches are logged and delivered.
    Lenient,
}

#[derive(Debug, Clone)]
pub struct FrameFormat {
    pub start: Vec<u8>,
    pub escape: Option<u8>,
    pub length: LengthRule,
    pub terminator: Option<u8>,
    pub checksum: Option<Checksum>,
    pub policy: Policy,
    pub ignore: Vec<u8>,
    pub restart_on_start: bool,
    pub max_length: usize,
}

impl FrameFormat {
    pub fn new(start: &[u8], length: LengthRule) -> Self {
        FrameFormat {
            start: start.to_vec(),
            escape: None,
            length,
            terminator: None,
            checksum: None,
            policy: Policy::Strict,
            ignore: Vec::new(),
            restart_on_start: false,
            max_length: 0x100,
        }
    }

    /// Doubled-escape framing: `escape x` starts a packet at `x`.
    pub fn escaped(escape: u8, length: LengthRule) -> Self {
        FrameFormat {
            escape: Some(escape),
            ..Self::new(&[], length)
        }
    }

    pub fn with_terminator(mut self, terminator: u8) -> Self {
        self.terminator = Some(terminator);
        self
    }

    pub fn with_checksum(mut self, position: usize, compute: fn(&[u8]) -> u8, policy: Policy) -> Self {
        self.checksum = Some(Checksum { position, compute });
        self.policy = policy;
        self
    }

    pub fn ignoring(mut self, bytes: &[u8]) -> Self {
        self.ignore = bytes.to_vec();
        self
    }

    pub fn restarting_on_start(mut self) -> Self {
        self.restart_on_start = true;
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    fn is_start(&self, byte: u8) -> bool {
        self.start.contains(&byte)
    }
}

/// Counters for conditions the framer recovered from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FramerStats {
    pub packets: usize,
    pub ignored: usize,
    pub corrupt: usize,
    pub partial: usize,
}

/// Byte-stream to packet decoder for one connection.
pub struct Framer {
    format: FrameFormat,
    buffer: Vec<u8>,
    expected: Option<usize>,
    escaped: bool,
    pending: VecDeque<u8>,
    last_progress: Instant,
    stats: FramerStats,
}

impl Framer {
    pub fn new(format: FrameFormat) -> Self {
        Framer {
            format,
            buffer: Vec::new(),
            expected: None,
            escaped: false,
            pending: VecDeque::new(),
            last_progress: Instant::now(),
            stats: FramerStats::default(),
        }
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Expected total of the packet being accumulated, once known.
    pub fn expected(&self) -> Option<usize> {
        self.expected
    }

    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty() && !self.escaped
    }

    pub fn reset(&mut self) {
        self.clear();
        self.escaped = false;
        self.pending.clear();
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.expected = None;
    }

    /// Reads until a whole packet is available.
    ///
    /// `Ok(None)` means no packet yet; a packet in progress stays buffered
    /// for the next call unless the line went quiet for the endpoint's input
    /// timeout. `Err(Corrupt)` means a packet was dropped and the stream has
    /// already been resynchronized.
    pub fn read_packet(&mut self, endpoint: &mut Endpoint, wait: bool) -> Result<Option<Vec<u8>>> {
        loop {
            let byte = match self.pending.pop_front() {
                Some(byte) => byte,
                None => {
                    let wait = if self.is_idle() { wait } else { true };
                    match endpoint.read_byte(wait)? {
                        Some(byte) => byte,
                        None => {
                            if !self.is_idle()
                                && self.last_progress.elapsed() >= endpoint.options().input_timeout
                            {
                                warn!("partial packet: {:02X?}", self.buffer);
                                self.stats.partial += 1;
                                let partial = std::mem::take(&mut self.buffer);
                                self.expected = None;
                                self.escaped = false;
                                self.requeue(&partial);
                                if !self.pending.is_empty() {
                                    continue;
                                }
                            }
                            return Ok(None);
                        }
                    }
                }
            };
            self.last_progress = Instant::now();

            if let Some(packet) = self.process(byte)? {
                return Ok(Some(packet));
            }
        }
    }

    fn process(&mut self, byte: u8) -> Result<Option<Vec<u8>>> {
        let mut boundary = false;

        if let Some(escape) = self.format.escape {
            if self.escaped {
                self.escaped = false;
                if byte != escape {
                    if !self.buffer.is_empty() {
                        warn!("short packet: {:02X?}", self.buffer);
                        self.clear();
                    }
                    boundary = true;
                }
            } else if byte == escape {
                self.escaped = true;
                return Ok(None);
            }
        }

        if self.buffer.is_empty() {
            if !boundary {
                if self.format.ignore.contains(&byte) {
                    return Ok(None);
                }
                if self.format.escape.is_some() || !self.format.is_start(byte) {
                    debug!("ignored byte: {:02X}", byte);
                    self.stats.ignored += 1;
                    return Ok(None);
                }
            }
        } else if self.format.restart_on_start && self.format.is_start(byte) {
            warn!("short packet: {:02X?}", self.buffer);
            self.clear();
        }

        if self.buffer.len() >= self.format.max_length {
            warn!("truncated packet: {:02X?}", self.buffer);
            debug!("discarded bytes: {:02X}", byte);
            self.clear();
            return Ok(None);
        }
        self.buffer.push(byte);

        match self.format.length.expect(&self.buffer) {
            Expect::More => {
                self.expected = None;
                Ok(None)
            }
            Expect::Unknown => {
                debug!("unknown packet: {:02X?}", self.buffer);
                self.stats.ignored += 1;
                self.clear();
                Ok(None)
            }
            Expect::Invalid => {
                self.buffer.pop();
                if self.buffer.is_empty() {
                    debug!("ignored byte: {:02X}", byte);
                    self.stats.ignored += 1;
                } else {
                    warn!("short packet: {:02X?}", self.buffer);
                    self.clear();
                    self.pending.push_front(byte);
                }
                Ok(None)
            }
            Expect::Length(total) if total > self.format.max_length => {
                warn!("truncated packet: {:02X?} (length {})", self.buffer, total);
                self.clear();
                Ok(None)
            }
            Expect::Length(total) => {
                self.expected = Some(total);
                if self.buffer.len() < total {
                    return Ok(None);
                }
                self.complete()
            }
        }
    }

    fn complete(&mut self) -> Result<Option<Vec<u8>>> {
        let packet = std::mem::take(&mut self.buffer);
        self.expected = None;

        if let Some(terminator) = self.format.terminator {
            if packet.last() != Some(&terminator) {
                warn!("corrupt packet: {:02X?}", packet);
                return Err(self.resynchronize(&packet));
            }
        }

        if let Some(checksum) = self.format.checksum {
            if let Some(index) = packet.len().checked_sub(checksum.position) {
                let mut zeroed = packet.clone();
                zeroed[index] = 0;
                let expected = (checksum.compute)(&zeroed);
                let actual = packet[index];

                if actual != expected {
                    match self.format.policy {
                        Policy::Lenient => warn!(
                            "incorrect input checksum: received {:02X}, calculated {:02X}",
                            actual, expected
                        ),
                        Policy::Strict => {
                            warn!(
                                "corrupt packet: {:02X?} (checksum {:02X} != {:02X})",
                                packet, actual, expected
                            );
                            return Err(self.resynchronize(&packet));
                        }
                    }
                }
            }
        }

        debug!("input packet: {:02X?}", packet);
        self.stats.packets += 1;
        Ok(Some(packet))
    }

    fn resynchronize(&mut self, packet: &[u8]) -> Error {
        self.stats.corrupt += 1;
        self.requeue(packet);
        Error::Corrupt
    }

    /// Queues everything from the next start marker in `packet` for
    /// re-reading and drops the rest.
    fn requeue(&mut self, packet: &[u8]) {
        let rest = packet.get(1..).unwrap_or(&[]);
        let keep = rest
            .iter()
            .position(|&b| self.format.is_start(b))
            .unwrap_or(rest.len());

        if keep > 0 {
            debug!("discarded bytes: {:02X?}", &rest[..keep]);
        }
        for &byte in rest[keep..].iter().rev() {
            self.pending.push_front(byte);
        }
    }

    /// The bytes `write_packet` puts on the wire for `payload`.
    ///
    /// With escape framing the first payload byte is the packet type and
    /// must not be the escape byte itself.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        match self.format.escape {
            Some(escape) if payload.first() == Some(&escape) => Err(Error::Unframeable(payload.to_vec())),
            Some(escape) => {
                let mut bytes = Vec::with_capacity(payload.len() * 2 + 1);
                bytes.push(escape);
                for &byte in payload {
                    bytes.push(byte);
                    if byte == escape {
                        bytes.push(byte);
                    }
                }
                Ok(bytes)
            }
            None => Ok(payload.to_vec()),
        }
    }

    /// Frames and writes `payload`, returning how many milliseconds the
    /// link needs to carry it.
    pub fn write_packet(&mut self, endpoint: &mut Endpoint, payload: &[u8]) -> Result<u64> {
        let bytes = self.encode(payload)?;
        debug!("output packet: {:02X?}", bytes);
        let count = endpoint.write_data(&bytes)?;
        Ok(endpoint.milliseconds_to_transfer(count))
    }
}
