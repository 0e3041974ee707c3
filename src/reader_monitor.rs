//! Reader monitor: a detection task that blocks on `GetStatusChange`
//! with an infinite timeout, and a per-active-reader watch task that
//! polls every 500ms once a card is connected. Both are grounded on the
//! teacher's `smart_card.rs` polling-loop structure and on the original
//! driver's `monitorRoutine` (list readers -> GetStatusChange(-1) ->
//! find present card).

use std::time::Duration;

use log::{debug, error, warn};
use pcsc::{Context, Protocols, ReaderState, ShareMode, State as PcscState, PNP_NOTIFICATION};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use std::sync::Arc;

use crate::error::Error;

/// An event produced by the monitor for the session engine to act on.
#[derive(Debug)]
pub enum MonitorEvent {
    NoReaders,
    NoCard,
    CardPresent { reader_name: String },
    Fatal(Error),
}

/// Handle used to cancel the monitor and to force an out-of-band
/// rescan (e.g. after a transport-loss error or a factory reset).
pub struct MonitorHandle {
    cancel: Arc<Notify>,
    force_scan: Arc<Notify>,
}

impl MonitorHandle {
    pub fn shutdown(&self) {
        self.cancel.notify_waiters();
    }

    pub fn force_scan(&self) {
        self.force_scan.notify_one();
    }
}

/// Spawn the detection task. Returns a channel of `MonitorEvent`s and a
/// handle to cancel or force a rescan.
pub fn start(ctx: Context) -> (mpsc::Receiver<MonitorEvent>, MonitorHandle) {
    let (tx, rx) = mpsc::channel(16);
    let cancel = Arc::new(Notify::new());
    let force_scan = Arc::new(Notify::new());

    let handle = MonitorHandle {
        cancel: Arc::clone(&cancel),
        force_scan: Arc::clone(&force_scan),
    };

    tokio::spawn(detect_loop(ctx, tx, cancel, force_scan));

    (rx, handle)
}

async fn detect_loop(
    ctx: Context,
    tx: mpsc::Sender<MonitorEvent>,
    cancel: Arc<Notify>,
    force_scan: Arc<Notify>,
) {
    // Reader states persist across iterations and have their
    // `CurrentState` synced to the previous `EventState` before each
    // wait, matching the teacher's `setup_reader_states`; without this
    // every wait would report every reader as "changed" immediately.
    let mut reader_states: Vec<ReaderState> =
        vec![ReaderState::new(PNP_NOTIFICATION(), PcscState::UNAWARE)];

    loop {
        tokio::select! {
            _ = cancel.notified() => {
                debug!("reader monitor cancelled");
                return;
            }
            result = scan_once(&ctx, std::mem::take(&mut reader_states)) => {
                match result {
                    Ok((event, states)) => {
                        reader_states = states;
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        error!("reader monitor scan failed: {err}");
                        let _ = tx.send(MonitorEvent::Fatal(err)).await;
                        return;
                    }
                }
            }
            _ = force_scan.notified() => {
                debug!("forced rescan requested");
                continue;
            }
        }
    }
}

async fn scan_once(
    ctx: &Context,
    reader_states: Vec<ReaderState>,
) -> Result<(MonitorEvent, Vec<ReaderState>), Error> {
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || scan_once_blocking(&ctx, reader_states))
        .await
        .map_err(|err| Error::Internal(format!("reader monitor task panicked: {err}")))?
}

fn scan_once_blocking(
    ctx: &Context,
    mut reader_states: Vec<ReaderState>,
) -> Result<(MonitorEvent, Vec<ReaderState>), Error> {
    let mut readers_buf = [0u8; 2048];
    let names: Vec<_> = ctx
        .list_readers(&mut readers_buf)
        .map_err(Error::from)?
        .map(|n| n.to_owned())
        .collect();

    if names.is_empty() {
        return Ok((MonitorEvent::NoReaders, reader_states));
    }

    // Drop readers that vanished (a reader being removed can linger as
    // `UNKNOWN` for one tick).
    reader_states.retain(|rs| {
        rs.name() == PNP_NOTIFICATION() || !rs.event_state().intersects(PcscState::UNKNOWN)
    });

    // Add newly connected readers.
    for name in &names {
        if !reader_states.iter().any(|rs| rs.name() == name.as_c_str()) {
            reader_states.push(ReaderState::new(name.as_c_str(), PcscState::UNAWARE));
        }
    }

    for rs in &mut reader_states {
        rs.sync_current_state();
    }

    // Blocking, infinite timeout: this is the suspension point the
    // detection task spends nearly all its time in.
    ctx.get_status_change(None, &mut reader_states)
        .map_err(Error::from)?;

    for rs in &reader_states {
        if rs.name() == PNP_NOTIFICATION() {
            continue;
        }
        if rs.event_state().intersects(PcscState::UNKNOWN | PcscState::IGNORE) {
            continue;
        }
        if rs.event_state().contains(PcscState::PRESENT) {
            let reader_name = rs.name().to_string_lossy().into_owned();
            return Ok((MonitorEvent::CardPresent { reader_name }, reader_states));
        }
    }

    Ok((MonitorEvent::NoCard, reader_states))
}

/// Spawn a 500ms-poll watch task for the currently active reader. Ends
/// (and the caller should force a rescan) when the card is removed or
/// the reader disappears.
pub fn start_watch(ctx: Context, reader_name: String, on_lost: mpsc::Sender<()>) -> MonitorHandle {
    let cancel = Arc::new(Notify::new());
    let force_scan = Arc::new(Notify::new()); // unused for watch, kept for symmetry
    let handle = MonitorHandle {
        cancel: Arc::clone(&cancel),
        force_scan: Arc::clone(&force_scan),
    };

    tokio::spawn(watch_loop(ctx, reader_name, on_lost, cancel));

    handle
}

async fn watch_loop(
    ctx: Context,
    reader_name: String,
    on_lost: mpsc::Sender<()>,
    cancel: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = cancel.notified() => return,
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                let ctx_clone = ctx.clone();
                let reader_name_clone = reader_name.clone();
                let still_present = tokio::task::spawn_blocking(move || {
                    card_still_present(&ctx_clone, &reader_name_clone)
                })
                .await
                .unwrap_or(false);

                if !still_present {
                    warn!("card removed from reader {reader_name}");
                    let _ = on_lost.send(()).await;
                    return;
                }
            }
        }
    }
}

fn card_still_present(ctx: &Context, reader_name: &str) -> bool {
    let name = match std::ffi::CString::new(reader_name) {
        Ok(n) => n,
        Err(_) => return false,
    };
    let mut reader_states = vec![ReaderState::new(name.as_c_str(), PcscState::UNAWARE)];

    if ctx
        .get_status_change(Some(Duration::from_millis(50)), &mut reader_states)
        .is_err()
    {
        return false;
    }

    let state = reader_states[0].event_state();
    !state.intersects(PcscState::EMPTY | PcscState::UNKNOWN)
}

/// Connect to a card present on `reader_name`. Exclusive share mode:
/// invariant 1 (at most one active card) is enforced by holding the
/// only handle this crate opens at a time.
pub fn connect(ctx: &Context, reader_name: &str) -> Result<pcsc::Card, Error> {
    let name = std::ffi::CString::new(reader_name)
        .map_err(|_| Error::Internal("reader name contains a NUL byte".to_string()))?;
    ctx.connect(&name, ShareMode::Exclusive, Protocols::ANY)
        .map_err(Error::from)
}
