//! Session engine: drives a connected card through select -> pair ->
//! open-secure-channel -> get-status, tracks the observable `State`,
//! and gates command-surface operations on that state. Grounded almost
//! directly on `keycard_context_v2.go`'s `monitorRoutine` for the
//! connect-card algorithm's step order, and on `nxm-rs-nexum`'s
//! `establish_session`/capability-gating shape for the Rust idiom.

use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use pcsc::Context;
use rand::rngs::OsRng;

use crate::commands;
use crate::config::EngineConfig;
use crate::crypto::{self, SessionKeys};
use crate::error::{Error, Result};
use crate::error_classifier;
use crate::pairing_store::PairingStore;
use crate::reader_monitor::{self, MonitorEvent, MonitorHandle};
use crate::status::StatusPublisher;
use crate::transport::{SecureChannel, Transport};
use crate::types::{ApplicationInfo, ApplicationStatus, Metadata, PairingRecord, State, Status, Version};

/// Holds everything tied to the single currently-connected card.
struct ActiveCard {
    reader_name: String,
    transport: Arc<Transport>,
    secure_channel: Option<SecureChannel>,
    pairing_index: Option<u8>,
    instance_uid_hex: String,
}

pub struct Engine {
    config: EngineConfig,
    ctx: Context,
    pairing_store: PairingStore,
    status: Arc<StatusPublisher>,
    active: Mutex<Option<ActiveCard>>,
    monitor_handle: Mutex<Option<MonitorHandle>>,
    watch_handle: Mutex<Option<MonitorHandle>>,
}

impl Engine {
    /// Establish the PC/SC context, open the pairing store, and start
    /// the monitor loop. Mirrors `NewKeycardContextV2`.
    pub fn start(config: EngineConfig) -> Result<Arc<Self>> {
        crate::logger::setup_logging(&config);

        let ctx = Context::establish(pcsc::Scope::User).map_err(|_| Error::NoProvider)?;
        let pairing_store = PairingStore::open(&config.pairing_store_path)?;

        let engine = Arc::new(Self {
            config,
            ctx,
            pairing_store,
            status: Arc::new(StatusPublisher::new()),
            active: Mutex::new(None),
            monitor_handle: Mutex::new(None),
            watch_handle: Mutex::new(None),
        });

        let (rx, handle) = reader_monitor::start(engine.ctx.clone());
        *engine.monitor_handle.lock().unwrap() = Some(handle);

        let engine_for_loop = Arc::clone(&engine);
        tokio::spawn(async move {
            engine_for_loop.run_monitor_loop(rx).await;
        });

        Ok(engine)
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.monitor_handle.lock().unwrap().as_ref() {
            handle.shutdown();
        }
        if let Some(handle) = self.watch_handle.lock().unwrap().take() {
            handle.shutdown();
        }
        *self.active.lock().unwrap() = None;
    }

    pub fn status(&self) -> Arc<StatusPublisher> {
        Arc::clone(&self.status)
    }

    async fn run_monitor_loop(self: Arc<Self>, mut rx: tokio::sync::mpsc::Receiver<MonitorEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                MonitorEvent::NoReaders => {
                    self.status.mutate(|_| Status {
                        state: State::WaitingForReader,
                        ..Default::default()
                    });
                }
                MonitorEvent::NoCard => {
                    *self.active.lock().unwrap() = None;
                    if let Some(handle) = self.watch_handle.lock().unwrap().take() {
                        handle.shutdown();
                    }
                    self.status.mutate(|_| Status {
                        state: State::WaitingForCard,
                        ..Default::default()
                    });
                }
                MonitorEvent::CardPresent { reader_name } => {
                    self.status.mutate(|mut s| {
                        s.state = State::ConnectingCard;
                        s
                    });
                    if let Err(err) = self.connect_card(&reader_name) {
                        error!("connect-card failed: {err}");
                    }
                }
                MonitorEvent::Fatal(err) => {
                    error!("reader monitor fatal error: {err}");
                    let state = if matches!(err, Error::NoProvider) {
                        State::NoPCSC
                    } else {
                        State::InternalError
                    };
                    self.status.mutate(|_| Status { state, ..Default::default() });
                    return;
                }
            }
        }
    }

    /// The connect-card algorithm (§4.D steps 1-10).
    fn connect_card(self: &Arc<Self>, reader_name: &str) -> Result<()> {
        *self.active.lock().unwrap() = None;
        if let Some(handle) = self.watch_handle.lock().unwrap().take() {
            handle.shutdown();
        }

        let card = match reader_monitor::connect(&self.ctx, reader_name) {
            Ok(card) => card,
            Err(err) => {
                self.publish_state(State::ConnectionError);
                return Err(err);
            }
        };

        let transport = Arc::new(Transport::new(card));

        let select_response = match transport.transmit(&commands::select_keycard().to_bytes()) {
            Ok(response) => response,
            Err(err) => {
                warn!("SELECT transmit failed: {err}");
                self.publish_state(State::ConnectionError);
                return Ok(());
            }
        };
        let app_info = match parse_select_response(&select_response) {
            Ok(info) => info,
            Err(_) => {
                self.status.mutate(|_| Status {
                    state: State::NotKeycard,
                    app_info: Some(ApplicationInfo { installed: false, ..Default::default() }),
                    ..Default::default()
                });
                return Ok(());
            }
        };

        if !app_info.installed {
            self.status.mutate(|_| Status {
                state: State::NotKeycard,
                app_info: Some(app_info),
                ..Default::default()
            });
            return Ok(());
        }
        if !app_info.initialized {
            self.status.mutate(|_| Status {
                state: State::EmptyKeycard,
                app_info: Some(app_info),
                ..Default::default()
            });
            return Ok(());
        }

        let instance_uid_hex = app_info.instance_uid_hex();
        let mut record = self.pairing_store.get(&instance_uid_hex);

        if record.is_none() {
            match self.pair_now(&transport) {
                Ok(new_record) => {
                    self.pairing_store.store(&instance_uid_hex, new_record.clone())?;
                    record = Some(new_record);
                }
                Err(Error::NoSlots) => {
                    self.publish_state(State::NoAvailablePairingSlots);
                    return Ok(());
                }
                Err(err) => {
                    warn!("pairing failed: {err}");
                    self.publish_state(State::PairingError);
                    return Ok(());
                }
            }
        }
        let record = record.expect("just paired or found existing record");

        let secure_channel = match self.open_secure_channel(&transport, &app_info, &record) {
            Ok(sc) => sc,
            Err(err) => {
                warn!("open secure channel failed, evicting pairing record: {err}");
                self.pairing_store.delete(&instance_uid_hex)?;
                self.publish_state(State::ConnectionError);
                return Ok(());
            }
        };

        *self.active.lock().unwrap() = Some(ActiveCard {
            reader_name: reader_name.to_string(),
            transport: Arc::clone(&transport),
            secure_channel: Some(secure_channel),
            pairing_index: Some(record.index),
            instance_uid_hex: instance_uid_hex.clone(),
        });

        // Second, independent watch task (§4.C): infinite-timeout waits on a
        // specific reader have proved unreliable on some platforms, so this
        // polls the now-active reader every 500ms instead of relying solely
        // on T_detect to notice the card going away.
        let (lost_tx, mut lost_rx) = tokio::sync::mpsc::channel(1);
        let watch_handle = reader_monitor::start_watch(self.ctx.clone(), reader_name.to_string(), lost_tx);
        *self.watch_handle.lock().unwrap() = Some(watch_handle);

        tokio::spawn({
            let engine = Arc::clone(self);
            async move {
                if lost_rx.recv().await.is_some() {
                    *engine.active.lock().unwrap() = None;
                    engine.publish_state(State::WaitingForCard);
                    if let Some(handle) = engine.monitor_handle.lock().unwrap().as_ref() {
                        handle.force_scan();
                    }
                }
            }
        });

        let app_status = match self.get_status_application() {
            Ok(status) => status,
            Err(err) => {
                warn!("GET STATUS failed: {err}");
                *self.active.lock().unwrap() = None;
                self.publish_state(State::ConnectionError);
                return Ok(());
            }
        };
        let metadata = self.get_metadata().ok();

        let state = state_from_retries(app_status.pin_retries, app_status.puk_retries);

        info!(
            "card connected: instanceUID={instance_uid_hex} state={:?} pin_retries={} puk_retries={}",
            state, app_status.pin_retries, app_status.puk_retries
        );

        self.status.update(Status {
            state,
            app_info: Some(app_info),
            app_status: Some(app_status),
            metadata,
        });

        Ok(())
    }

    fn publish_state(&self, state: State) {
        self.status.mutate(|_| Status { state, ..Default::default() });
    }

    fn pair_now(&self, transport: &Arc<Transport>) -> Result<PairingRecord> {
        use crate::types::DEFAULT_PAIRING_PASSWORD;

        let mut host_challenge = [0u8; 32];
        rand::RngCore::fill_bytes(&mut OsRng, &mut host_challenge);

        let response = transport.transmit(&commands::pair_first_stage(&host_challenge).to_bytes())?;
        let (sw, payload) = split_status_word(&response)?;
        if sw != 0x9000 {
            return Err(map_pairing_status_word(sw));
        }
        if payload.len() < 64 {
            return Err(Error::PairingFailed("first-stage response too short".to_string()));
        }
        let card_cryptogram: [u8; 32] = payload[..32].try_into().unwrap();
        let card_challenge: [u8; 32] = payload[32..64].try_into().unwrap();

        let shared_secret = crypto::generate_pairing_token(DEFAULT_PAIRING_PASSWORD);
        if card_cryptogram != crypto::calculate_cryptogram(&shared_secret, &host_challenge) {
            return Err(Error::PairingFailed("card cryptogram verification failed".to_string()));
        }

        let client_cryptogram = crypto::calculate_cryptogram(&shared_secret, &card_challenge);
        let response = transport.transmit(&commands::pair_final_stage(&client_cryptogram).to_bytes())?;
        let (sw, payload) = split_status_word(&response)?;
        if sw != 0x9000 {
            return Err(map_pairing_status_word(sw));
        }
        if payload.is_empty() {
            return Err(Error::PairingFailed("final-stage response too short".to_string()));
        }
        let index = payload[0];
        let salt = &payload[1..];

        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(shared_secret);
        hasher.update(salt);
        let key: [u8; 32] = hasher.finalize().into();

        Ok(PairingRecord { index, key })
    }

    fn open_secure_channel(
        &self,
        transport: &Arc<Transport>,
        app_info: &ApplicationInfo,
        record: &PairingRecord,
    ) -> Result<SecureChannel> {
        let host_private_key = k256::SecretKey::random(&mut OsRng);
        let host_public_key_bytes = host_private_key.public_key().to_sec1_bytes();

        let response = transport.transmit(
            &commands::open_secure_channel(record.index, &host_public_key_bytes).to_bytes(),
        )?;
        let (sw, payload) = split_status_word(&response)?;
        if sw != 0x9000 || payload.len() != 48 {
            return Err(Error::TransportLoss("open secure channel rejected".to_string()));
        }

        let card_challenge: [u8; 32] = payload[..32].try_into().unwrap();
        let iv: [u8; 16] = payload[32..48].try_into().unwrap();

        let card_public_key = k256::PublicKey::from_sec1_bytes(&app_info.card_public_key)
            .map_err(|_| Error::TransportLoss("malformed card public key from SELECT".to_string()))?;
        let shared_secret = crypto::generate_ecdh_shared_secret(&host_private_key, &card_public_key);

        let keys: SessionKeys = crypto::derive_session_keys(shared_secret, &record.key, &card_challenge);
        let mut secure_channel = SecureChannel::new(Arc::clone(transport), keys, iv);

        let mut host_challenge = [0u8; 32];
        rand::RngCore::fill_bytes(&mut OsRng, &mut host_challenge);
        let mutual_auth = commands::mutually_authenticate(&host_challenge);
        secure_channel.transmit(mutual_auth.cla, mutual_auth.ins, mutual_auth.p1, mutual_auth.p2, &mutual_auth.data)?;

        Ok(secure_channel)
    }

    fn get_status_application(&self) -> Result<ApplicationStatus> {
        let mut active_guard = self.active.lock().unwrap();
        let active = active_guard.as_mut().ok_or(Error::NotConnected)?;
        let sc = active.secure_channel.as_mut().ok_or(Error::NotConnected)?;
        let cmd = commands::get_status_application();
        let response = sc.transmit(cmd.cla, cmd.ins, cmd.p1, cmd.p2, &cmd.data)?;
        parse_status_response(&response)
    }

    fn get_metadata(&self) -> Result<Metadata> {
        let mut active_guard = self.active.lock().unwrap();
        let active = active_guard.as_mut().ok_or(Error::NotConnected)?;
        let sc = active.secure_channel.as_mut().ok_or(Error::NotConnected)?;
        let cmd = commands::get_data_public();
        let response = sc.transmit(cmd.cla, cmd.ins, cmd.p1, cmd.p2, &cmd.data)?;
        parse_metadata_response(&response)
    }

    /// Send an already-built APDU through the active secure channel.
    /// Used by the command surface for every authorized operation.
    pub(crate) fn send_secure(&self, apdu: &commands::Apdu) -> Result<Vec<u8>> {
        let mut active_guard = self.active.lock().unwrap();
        let active = active_guard.as_mut().ok_or(Error::NotConnected)?;
        let sc = active.secure_channel.as_mut().ok_or(Error::NotConnected)?;
        let result = sc.transmit(apdu.cla, apdu.ins, apdu.p1, apdu.p2, &apdu.data);

        if let Err(ref err) = result {
            if error_classifier::is_transport_loss(err) {
                drop(active_guard);
                self.active.lock().unwrap().take();
                self.publish_state(State::ConnectionError);
                if let Some(handle) = self.monitor_handle.lock().unwrap().as_ref() {
                    handle.force_scan();
                }
            } else if let Error::Protocol { sw } = *err {
                if error_classifier::is_authentication_requirement(sw) && self.current_state() == State::Authorized {
                    drop(active_guard);
                    self.status.mutate(|mut s| {
                        s.state = State::Ready;
                        s
                    });
                }
            }
        }
        result
    }

    pub(crate) fn current_state(&self) -> State {
        self.status.get().state
    }

    /// Re-issue GET STATUS, recompute the derived state from the fresh
    /// retry counters, publish, and return the refreshed status. Used
    /// after any credential-changing operation and after a wrong-PIN/PUK
    /// rejection (§7 WrongCredential handling).
    pub(crate) fn refresh_status_and_resolve_state(&self) -> Result<ApplicationStatus> {
        let app_status = self.get_status_application()?;
        let state = state_from_retries(app_status.pin_retries, app_status.puk_retries);
        self.status.mutate(|mut s| {
            s.state = state;
            s.app_status = Some(app_status.clone());
            s
        });
        Ok(app_status)
    }

    /// Force the publicly-visible state after an operation that is
    /// known to succeed without needing a fresh retry-counter read
    /// (VERIFY PIN success, CHANGE PIN/PUK, UNBLOCK PIN, LOAD MNEMONIC).
    pub(crate) fn set_state_after_operation(&self, state: State) {
        self.status.mutate(|mut s| {
            s.state = state;
            s
        });
    }

    pub(crate) fn force_rescan(&self) {
        *self.active.lock().unwrap() = None;
        if let Some(handle) = self.watch_handle.lock().unwrap().take() {
            handle.shutdown();
        }
        if let Some(handle) = self.monitor_handle.lock().unwrap().as_ref() {
            handle.force_scan();
        }
    }

    pub(crate) fn instance_uid_hex(&self) -> Result<String> {
        let active_guard = self.active.lock().unwrap();
        let active = active_guard.as_ref().ok_or(Error::NotConnected)?;
        Ok(active.instance_uid_hex.clone())
    }

    pub(crate) fn evict_pairing(&self, instance_uid_hex: &str) -> Result<()> {
        self.pairing_store.delete(instance_uid_hex)
    }

    pub(crate) fn current_metadata(&self) -> Result<Metadata> {
        self.get_metadata()
    }

    pub(crate) fn store_metadata(&self, metadata: &Metadata) -> Result<()> {
        let bytes = serde_json::to_vec(metadata)
            .map_err(|e| Error::Internal(format!("failed to serialise metadata: {e}")))?;
        self.send_secure(&commands::store_data_public(&bytes))?;
        self.status.mutate(|mut s| {
            s.metadata = Some(metadata.clone());
            s
        });
        Ok(())
    }

    pub(crate) fn current_app_info(&self) -> Option<ApplicationInfo> {
        self.status.get().app_info
    }
}

fn state_from_retries(pin_retries: u8, puk_retries: u8) -> State {
    if puk_retries == 0 {
        State::BlockedPUK
    } else if pin_retries == 0 {
        State::BlockedPIN
    } else {
        State::Ready
    }
}

fn split_status_word(rpdu: &[u8]) -> Result<(u16, &[u8])> {
    if rpdu.len() < 2 {
        return Err(Error::Protocol { sw: 0 });
    }
    let (body, sw_bytes) = rpdu.split_at(rpdu.len() - 2);
    let sw = u16::from_be_bytes([sw_bytes[0], sw_bytes[1]]);
    Ok((sw, body))
}

fn map_pairing_status_word(sw: u16) -> Error {
    match sw {
        0x6A84 => Error::NoSlots,
        other => Error::PairingFailed(format!("status word {other:04X}")),
    }
}

fn parse_select_response(response: &[u8]) -> Result<ApplicationInfo> {
    let (sw, body) = split_status_word(response)?;
    if sw == 0x6A82 {
        // File/applet not found.
        return Ok(ApplicationInfo { installed: false, ..Default::default() });
    }
    if sw != 0x9000 {
        return Err(Error::Protocol { sw });
    }
    if body.len() < 16 {
        // Uninitialized card selects successfully but reports nothing
        // beyond "installed".
        return Ok(ApplicationInfo { installed: true, initialized: false, ..Default::default() });
    }

    let instance_uid = body[0..16].to_vec();
    let mut offset = 16;
    let key_uid = if body.len() >= offset + 32 && body[offset..offset + 32] != [0u8; 32] {
        let k = body[offset..offset + 32].to_vec();
        offset += 32;
        k
    } else {
        offset += 32.min(body.len().saturating_sub(offset));
        Vec::new()
    };

    let card_public_key = if let Some(&pub_len) = body.get(offset) {
        offset += 1;
        let pub_len = pub_len as usize;
        let key = body
            .get(offset..offset + pub_len)
            .ok_or(Error::Protocol { sw: 0 })?
            .to_vec();
        offset += pub_len;
        key
    } else {
        Vec::new()
    };

    let version = if body.len() >= offset + 2 {
        let v = Version::from_raw([body[offset], body[offset + 1]]);
        offset += 2;
        Some(v)
    } else {
        None
    };
    let available_pairing_slots = body.get(offset).copied().unwrap_or(0);
    offset += 1;
    let capabilities = body.get(offset).copied().unwrap_or(0);

    Ok(ApplicationInfo {
        installed: true,
        initialized: true,
        instance_uid,
        key_uid,
        card_public_key,
        version,
        available_pairing_slots,
        capabilities,
    })
}

fn parse_status_response(response: &[u8]) -> Result<ApplicationStatus> {
    let (sw, body) = split_status_word(response)?;
    if sw != 0x9000 {
        return Err(Error::Protocol { sw });
    }
    if body.len() < 3 {
        return Err(Error::Protocol { sw: 0 });
    }
    Ok(ApplicationStatus {
        pin_retries: body[0],
        puk_retries: body[1],
        key_initialized: body[2] != 0,
        current_derivation_path: None,
    })
}

fn parse_metadata_response(response: &[u8]) -> Result<Metadata> {
    let (sw, body) = split_status_word(response)?;
    if sw != 0x9000 {
        return Err(Error::Protocol { sw });
    }
    if body.is_empty() {
        return Ok(Metadata::default());
    }
    serde_json::from_slice(body).map_err(|e| Error::Internal(format!("malformed metadata: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_status_word_separates_body_and_sw() {
        let rpdu = [0xAA, 0xBB, 0x90, 0x00];
        let (sw, body) = split_status_word(&rpdu).unwrap();
        assert_eq!(sw, 0x9000);
        assert_eq!(body, &[0xAA, 0xBB]);
    }

    #[test]
    fn parse_select_response_handles_not_found() {
        let rpdu = [0x6A, 0x82];
        let info = parse_select_response(&rpdu).unwrap();
        assert!(!info.installed);
    }

    #[test]
    fn parse_status_response_reads_retry_counters() {
        let mut rpdu = vec![3u8, 5u8, 1u8];
        rpdu.extend_from_slice(&[0x90, 0x00]);
        let status = parse_status_response(&rpdu).unwrap();
        assert_eq!(status.pin_retries, 3);
        assert_eq!(status.puk_retries, 5);
        assert!(status.key_initialized);
    }

    #[test]
    fn parse_select_response_reads_card_public_key() {
        let mut body = vec![0xAAu8; 16]; // instance_uid
        body.extend_from_slice(&[0u8; 32]); // no key_uid yet
        let pub_key = [0x04u8; 65];
        body.push(pub_key.len() as u8);
        body.extend_from_slice(&pub_key);
        body.extend_from_slice(&[3, 1]); // version 3.1
        body.push(2); // available_pairing_slots
        body.push(0b0000_0011); // capabilities

        let mut rpdu = body;
        rpdu.extend_from_slice(&[0x90, 0x00]);

        let info = parse_select_response(&rpdu).unwrap();
        assert!(info.installed);
        assert!(info.initialized);
        assert_eq!(info.card_public_key, pub_key.to_vec());
        assert_eq!(info.available_pairing_slots, 2);
        assert!(info.version.unwrap().supports_extended_public_export());
    }
}
