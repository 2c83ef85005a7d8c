//! Mock bulk transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{BulkTransport, TransportError};
use crate::protocol::packet::{self, OdinCommand};

/// Mock transport for unit testing session and transfer logic.
///
/// Clones share the response queue and write log, so a test can keep a
/// handle to a transport it has handed to a session.
#[derive(Clone)]
pub struct MockTransport {
    /// Queued device responses, returned on read in order.
    read_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Simulated VID/PID.
    vid: u16,
    pid: u16,
    /// Whether the device is "connected".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            read_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            vid: 0x04E8,
            pid: 0x685D,
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue raw bytes to be returned on a future read.
    pub fn queue_response(&self, bytes: &[u8]) {
        self.read_queue.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Queue a framed packet as a device response.
    pub fn queue_packet(&self, command: OdinCommand, payload: &[u8]) {
        self.queue_response(&packet::encode(command, payload));
    }

    /// Get all captured writes.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Simulate device disconnect.
    pub fn simulate_disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate device reconnect.
    pub fn simulate_reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }

    pub fn set_ids(&mut self, vid: u16, pid: u16) {
        self.vid = vid;
        self.pid = pid;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl BulkTransport for MockTransport {
    fn write(&self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        let mut queue = self.read_queue.lock().unwrap();
        match queue.pop_front() {
            Some(mut chunk) => {
                // A bulk read returns at most `max_len`; anything beyond it
                // stays buffered for the next read.
                if chunk.len() > max_len {
                    let rest = chunk.split_off(max_len);
                    queue.push_front(rest);
                }
                Ok(chunk)
            }
            None => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn release(&mut self) {
        *self.connected.lock().unwrap() = false;
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
