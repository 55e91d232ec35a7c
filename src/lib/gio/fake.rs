//! In-memory transports for hardware-free tests.

use super::{Options, SerialParameters, Transport, TransportKind};
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

enum Chunk {
    Data(Vec<u8>),
    Fail,
}

#[derive(Default)]
struct Script {
    chunks: VecDeque<Chunk>,
    stall: bool,
    written: Vec<Vec<u8>>,
}

/// Hands out scripted chunks, one per transport read, and records writes.
///
/// Clones share the script, so a test keeps one clone to feed the
/// endpoint that owns the other.
#[derive(Clone, Default)]
pub struct FakeTransport {
    script: Arc<Mutex<Script>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty read sleeps for the whole initial wait, like a quiet line.
    pub fn stalling() -> Self {
        let fake = Self::default();
        fake.script.lock().unwrap().stall = true;
        fake
    }

    /// Empty slices are skipped, an empty read means a quiet line.
    pub fn push(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut script = self.script.lock().unwrap();
        script.chunks.push_back(Chunk::Data(data.to_vec()));
    }

    pub fn fail_next(&self) {
        self.script.lock().unwrap().chunks.push_back(Chunk::Fail);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.script.lock().unwrap().written.clone()
    }

    pub fn endpoint(&self, options: Options) -> super::Endpoint {
        super::Endpoint::with_transport(Box::new(self.clone()), options)
    }
}

impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn read_data(&mut self, buffer: &mut [u8], initial: Duration, _subsequent: Duration) -> Result<usize> {
        let mut script = self.script.lock().unwrap();
        match script.chunks.pop_front() {
            Some(Chunk::Data(mut data)) => {
                let n = data.len().min(buffer.len());
                buffer[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    script.chunks.push_front(Chunk::Data(data.split_off(n)));
                }
                Ok(n)
            }
            Some(Chunk::Fail) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "line dropped").into()),
            None => {
                let stall = script.stall;
                drop(script);
                if stall {
                    thread::sleep(initial);
                }
                Ok(0)
            }
        }
    }

    fn await_input(&mut self, timeout: Duration) -> Result<bool> {
        let script = self.script.lock().unwrap();
        let ready = !script.chunks.is_empty();
        let stall = script.stall;
        drop(script);
        if !ready && stall {
            thread::sleep(timeout);
        }
        Ok(ready)
    }

    fn write_data(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
        self.script.lock().unwrap().written.push(data.to_vec());
        Ok(data.len())
    }

    fn reconfigure(&mut self, _parameters: &SerialParameters) -> Result<()> {
        Ok(())
    }
}

type Reply = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send>;

/// A display that answers only while the line runs at `baud`.
///
/// `reply` maps each written request to the bytes the display sends back.
pub struct FakeDevice {
    baud: u32,
    current: u32,
    fixed: bool,
    reply: Reply,
    pending: VecDeque<u8>,
    requests: Arc<Mutex<Vec<(u32, Vec<u8>)>>>,
}

impl FakeDevice {
    pub fn new(baud: u32, reply: impl Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static) -> Self {
        FakeDevice {
            baud,
            current: 0,
            fixed: false,
            reply: Box::new(reply),
            pending: VecDeque::new(),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A link without line settings, such as USB or Bluetooth.
    pub fn fixed_rate(reply: impl Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static) -> Self {
        FakeDevice {
            fixed: true,
            ..Self::new(0, reply)
        }
    }

    /// Every request written so far, with the baud it was sent at.
    pub fn requests(&self) -> Arc<Mutex<Vec<(u32, Vec<u8>)>>> {
        self.requests.clone()
    }
}

impl Transport for FakeDevice {
    fn kind(&self) -> TransportKind {
        if self.fixed {
            TransportKind::Bluetooth
        } else {
            TransportKind::Serial
        }
    }

    fn read_data(&mut self, buffer: &mut [u8], _initial: Duration, _subsequent: Duration) -> Result<usize> {
        let n = self.pending.len().min(buffer.len());
        for (slot, byte) in buffer.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn await_input(&mut self, _timeout: Duration) -> Result<bool> {
        Ok(!self.pending.is_empty())
    }

    fn write_data(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
        self.requests.lock().unwrap().push((self.current, data.to_vec()));
        if self.fixed || self.current == self.baud {
            if let Some(reply) = (self.reply)(data) {
                self.pending.extend(reply);
            }
        }
        Ok(data.len())
    }

    fn reconfigure(&mut self, parameters: &SerialParameters) -> Result<()> {
        if self.fixed {
            return Err(Error::NotSerial("bluetooth"));
        }
        self.current = parameters.baud;
        self.pending.clear();
        Ok(())
    }
}
