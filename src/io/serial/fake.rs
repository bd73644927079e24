// src/io/serial/fake.rs
//
// Scripted transport and port used by tests in place of real devices.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::transport::{BoxedPort, SerialTransport};
use crate::error::{Result, SerialError};

/// What happens when the fake transport opens a given speed
#[derive(Clone)]
pub enum FakeOpen {
    Open(FakePort),
    Fail(&'static str),
    /// Never completes; only a timeout ends the attempt
    Hang,
    /// Opens on a blocking thread after the delay, like a slow driver
    Late(FakePort, Duration),
}

/// Transport whose open outcome is scripted per speed.
/// Speeds without a script fail as if the device rejected them.
#[derive(Default)]
pub struct FakeTransport {
    outcomes: Mutex<HashMap<u32, FakeOpen>>,
    attempted: Mutex<Vec<u32>>,
    /// Opens started whose handle has not been dropped yet
    outstanding: Arc<AtomicUsize>,
    outstanding_at_open: Mutex<Vec<usize>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, baud_rate: u32, outcome: FakeOpen) -> Self {
        self.set(baud_rate, outcome);
        self
    }

    pub fn set(&self, baud_rate: u32, outcome: FakeOpen) {
        self.outcomes.lock().unwrap().insert(baud_rate, outcome);
    }

    pub fn attempted(&self) -> Vec<u32> {
        self.attempted.lock().unwrap().clone()
    }

    /// Handles opened through this transport and not yet closed
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// `outstanding()` as seen at the start of each open, in call order
    pub fn outstanding_at_open(&self) -> Vec<usize> {
        self.outstanding_at_open.lock().unwrap().clone()
    }
}

#[async_trait]
impl SerialTransport for FakeTransport {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<BoxedPort> {
        self.attempted.lock().unwrap().push(baud_rate);
        self.outstanding_at_open.lock().unwrap().push(self.outstanding());
        let outcome = self.outcomes.lock().unwrap().get(&baud_rate).cloned();

        let message = match outcome {
            Some(FakeOpen::Open(port)) => {
                let port: BoxedPort = Box::new(TrackedPort::new(port, self.outstanding.clone()));
                return Ok(port);
            }
            Some(FakeOpen::Late(port, delay)) => {
                // Counted from the start, the way a driver holds the device while opening
                self.outstanding.fetch_add(1, Ordering::SeqCst);
                let counter = self.outstanding.clone();
                let opened = tokio::task::spawn_blocking(move || {
                    std::thread::sleep(delay);
                    TrackedPort {
                        inner: port,
                        outstanding: counter,
                    }
                })
                .await;
                match opened {
                    Ok(tracked) => {
                        let port: BoxedPort = Box::new(tracked);
                        return Ok(port);
                    }
                    Err(e) => {
                        self.outstanding.fetch_sub(1, Ordering::SeqCst);
                        e.to_string()
                    }
                }
            }
            Some(FakeOpen::Fail(message)) => message.to_string(),
            Some(FakeOpen::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                "hung".to_string()
            }
            None => "No such device".to_string(),
        };

        Err(SerialError::Open {
            path: path.to_string(),
            baud_rate,
            message,
        })
    }
}

/// Keeps the transport's outstanding count until dropped
struct TrackedPort {
    inner: FakePort,
    outstanding: Arc<AtomicUsize>,
}

impl TrackedPort {
    fn new(inner: FakePort, outstanding: Arc<AtomicUsize>) -> Self {
        outstanding.fetch_add(1, Ordering::SeqCst);
        TrackedPort { inner, outstanding }
    }
}

impl Drop for TrackedPort {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Read for TrackedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for TrackedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum FakeRead {
    Data(Vec<u8>),
    Eof,
    Error(io::ErrorKind),
}

#[derive(Default)]
struct FakePortState {
    reads: VecDeque<FakeRead>,
    repeat: Option<Vec<u8>>,
    writes: Vec<u8>,
    fail_writes: bool,
}

/// Port that replays scripted reads and captures writes.
/// Clones share state, so a test can keep one and hand the other to the link.
#[derive(Clone, Default)]
pub struct FakePort {
    state: Arc<Mutex<FakePortState>>,
}

impl FakePort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_read(&self, bytes: &[u8]) {
        self.state.lock().unwrap().reads.push_back(FakeRead::Data(bytes.to_vec()));
    }

    pub fn push_eof(&self) {
        self.state.lock().unwrap().reads.push_back(FakeRead::Eof);
    }

    pub fn push_error(&self, kind: io::ErrorKind) {
        self.state.lock().unwrap().reads.push_back(FakeRead::Error(kind));
    }

    /// Once the script runs out, return `bytes` on every read.
    pub fn repeat(&self, bytes: &[u8]) {
        self.state.lock().unwrap().repeat = Some(bytes.to_vec());
    }

    pub fn fail_writes(&self) {
        self.state.lock().unwrap().fail_writes = true;
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().writes.clone()
    }
}

impl Read for FakePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let next = {
            let mut state = self.state.lock().unwrap();
            match state.reads.pop_front() {
                Some(read) => Some(read),
                None => state.repeat.clone().map(FakeRead::Data),
            }
        };

        match next {
            Some(FakeRead::Data(bytes)) => {
                std::thread::sleep(Duration::from_millis(1));
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    self.state
                        .lock()
                        .unwrap()
                        .reads
                        .push_front(FakeRead::Data(bytes[n..].to_vec()));
                }
                Ok(n)
            }
            Some(FakeRead::Eof) => Ok(0),
            Some(FakeRead::Error(kind)) => Err(io::Error::new(kind, "fake read error")),
            None => {
                std::thread::sleep(Duration::from_millis(1));
                Err(io::ErrorKind::TimedOut.into())
            }
        }
    }
}

impl Write for FakePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "fake write error"));
        }
        state.writes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_port_replays_script() {
        let mut port = FakePort::new();
        port.push_read(b"abc");
        port.push_eof();

        let mut buf = [0u8; 2];
        assert_eq!(port.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(port.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'c');
        assert_eq!(port.read(&mut buf).unwrap(), 0);
        assert_eq!(
            port.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );
    }

    #[test]
    fn test_fake_port_captures_writes() {
        let port = FakePort::new();
        let mut handle = port.clone();
        handle.write_all(b"PING\n").unwrap();

        assert_eq!(port.written(), b"PING\n".to_vec());
    }
}
