//! APDU transport: a dedicated OS thread owns the PC/SC card handle and
//! serializes all transmissions through a request/reply channel,
//! mirroring the original driver's `runtime.LockOSThread()` + channel
//! dispatch loop (several PC/SC providers require thread affinity for
//! the handle that performs `Transmit`).

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use log::{debug, error};
use pcsc::{Card, MAX_BUFFER_SIZE};

use crate::crypto::{self, SessionKeys};
use crate::error::{Error, Result};

enum WorkerRequest {
    Transmit(Vec<u8>, mpsc::Sender<Result<Vec<u8>>>),
    Close,
}

/// Owns the PC/SC card handle on a dedicated thread and exposes a
/// synchronous, serialized `transmit`.
pub struct Transport {
    requests: mpsc::Sender<WorkerRequest>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Transport {
    pub fn new(card: Card) -> Self {
        let (tx, rx) = mpsc::channel::<WorkerRequest>();

        let worker = thread::spawn(move || {
            // Communication with the card must happen on a fixed
            // thread; some PC/SC providers tie handle state to the
            // calling thread.
            Self::worker_loop(card, rx);
        });

        Self {
            requests: tx,
            worker: Some(worker),
        }
    }

    fn worker_loop(card: Card, rx: mpsc::Receiver<WorkerRequest>) {
        let mut rapdu_buf = [0u8; MAX_BUFFER_SIZE];

        while let Ok(request) = rx.recv() {
            match request {
                WorkerRequest::Transmit(apdu, reply) => {
                    let result = card
                        .transmit(&apdu, &mut rapdu_buf)
                        .map(|rpdu| rpdu.to_vec())
                        .map_err(Error::from);
                    if let Err(ref err) = result {
                        error!("APDU transmit failed: {err}");
                    }
                    let _ = reply.send(result);
                }
                WorkerRequest::Close => return,
            }
        }
    }

    /// Send a raw APDU and block for the raw response. Serialized: no
    /// two calls interleave on the underlying handle because the
    /// worker thread processes one request at a time.
    pub fn transmit(&self, apdu: &[u8]) -> Result<Vec<u8>> {
        let (tx, rx) = mpsc::channel();
        self.requests
            .send(WorkerRequest::Transmit(apdu.to_vec(), tx))
            .map_err(|_| Error::TransportLoss("transport worker gone".to_string()))?;

        rx.recv()
            .map_err(|_| Error::TransportLoss("transport worker dropped reply".to_string()))?
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let _ = self.requests.send(WorkerRequest::Close);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Wraps a `Transport` with AES-CBC encryption and IV-chained MAC once
/// OPEN SECURE CHANNEL has completed.
pub struct SecureChannel {
    transport: Arc<Transport>,
    keys: SessionKeys,
    iv: [u8; 16],
}

impl SecureChannel {
    pub fn new(transport: Arc<Transport>, keys: SessionKeys, iv: [u8; 16]) -> Self {
        Self { transport, keys, iv }
    }

    /// Encrypt `apdu`, transmit it, decrypt and MAC-verify the reply.
    /// A MAC failure is surfaced as a `TransportLoss`, since it means
    /// the secure channel can no longer be trusted and must be
    /// re-established from scratch (§4.A).
    pub fn transmit(&mut self, cla: u8, ins: u8, p1: u8, p2: u8, data: &[u8]) -> Result<Vec<u8>> {
        let encrypted_data = crypto::encrypt_data(data, &self.keys.enc, &self.iv);

        let mut meta = [0u8; 5];
        meta[0] = cla;
        meta[1] = ins;
        meta[2] = p1;
        meta[3] = p2;
        meta[4] = (encrypted_data.len() + 16) as u8;
        self.iv = crypto::calculate_mac(&meta, &encrypted_data, &self.keys.mac);

        let mut payload = Vec::with_capacity(16 + encrypted_data.len());
        payload.extend_from_slice(&self.iv);
        payload.extend_from_slice(&encrypted_data);

        let mut command = Vec::with_capacity(5 + payload.len() + 1);
        command.push(cla);
        command.push(ins);
        command.push(p1);
        command.push(p2);
        command.push(payload.len() as u8);
        command.extend_from_slice(&payload);
        command.push(0x00);

        let rpdu = self.transport.transmit(&command)?;
        debug!("secure channel rpdu len={}", rpdu.len());

        self.decrypt_response(&rpdu)
    }

    fn decrypt_response(&mut self, rpdu: &[u8]) -> Result<Vec<u8>> {
        if rpdu.len() < 2 {
            return Err(Error::Protocol { sw: 0 });
        }
        let (body, sw_bytes) = rpdu.split_at(rpdu.len() - 2);
        let sw = u16::from_be_bytes([sw_bytes[0], sw_bytes[1]]);

        if sw != 0x9000 {
            // Logical errors are returned unencrypted by the applet.
            return Err(Error::Protocol { sw });
        }

        if body.len() < 16 {
            return Err(Error::TransportLoss("secure channel response too short".to_string()));
        }

        let (rmac, rdata) = body.split_at(16);

        let mut meta = [0u8; 5];
        meta[0] = body.len() as u8;
        let expected_mac = crypto::calculate_mac(&meta, rdata, &self.keys.mac);

        if rmac != expected_mac {
            return Err(Error::TransportLoss("secure channel MAC verification failed".to_string()));
        }
        self.iv = expected_mac;

        let decrypted = crypto::decrypt_data(rdata, &self.keys.enc, &self.iv)?;
        let mut response = decrypted;
        response.extend_from_slice(&[0x90, 0x00]);
        Ok(response)
    }
}
