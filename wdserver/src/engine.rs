//! Engine router (C8): owns no table of its own beyond the
//! key<->slot mapping, delegating all VM-slot bookkeeping to the pool
//! (§4.8). Each VM connection runs as its own task; inbound frames from
//! the frontend arrive over the sibling IPC channel and are dispatched
//! here to the matching slot's injection channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Mutex;
use wdlib::filestore::FileStore;
use wdlib::netmsg::{NetMsg, Opcode};
use wdlib::writeback::WritebackStore;
use wdlib::BackendKey;
use wdvm::{Dispatch, VmEvent, VmPool};

use crate::connection::{Connection, RecvOutcome, Transport};
use crate::error::Error;
use crate::fabric::{IpcChannel, IpcFrame, MessageType};

/// Matches the client-facing 1s timeout; the VM channel gets the same
/// heartbeat treatment (§5).
pub const VM_TIMEOUT: Duration = Duration::from_secs(1);

pub struct EngineState {
    pub pool: Mutex<VmPool>,
    pub key_to_slot: Mutex<HashMap<BackendKey, usize>>,
    pub writeback: WritebackStore,
    pub emessages: Arc<FileStore>,
    pub slot_inject: Mutex<Vec<Option<UnboundedSender<NetMsg>>>>,
}

impl EngineState {
    pub fn new(pool: VmPool, writeback: WritebackStore, emessages: Arc<FileStore>, slot_count: usize) -> Self {
        EngineState {
            pool: Mutex::new(pool),
            key_to_slot: Mutex::new(HashMap::new()),
            writeback,
            emessages,
            slot_inject: Mutex::new((0..slot_count).map(|_| None).collect()),
        }
    }

    async fn inject(&self, idx: usize, msg: NetMsg) {
        let senders = self.slot_inject.lock().await;
        if let Some(Some(tx)) = senders.get(idx) {
            let _ = tx.send(msg);
        }
    }
}

/// The VM-facing listener: pops the boot-queue head on every accept and
/// spawns its connection task.
pub async fn run_vm_listener(listener: TcpListener, state: Arc<EngineState>, sibling: Arc<IpcChannel>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("vm listener accept failed: {e}");
                continue;
            }
        };

        let idx = match state.pool.lock().await.accept().await {
            Ok(Some(idx)) => idx,
            Ok(None) => {
                warn!("vm connected from {peer_addr} with an empty boot queue, dropping");
                continue;
            }
            Err(e) => {
                error!("accepting vm connection: {e}");
                continue;
            }
        };

        let conn = Connection::new(Transport::Plain(stream), peer_addr, Arc::clone(&state.emessages));
        let (tx, rx) = mpsc::unbounded_channel();
        state.slot_inject.lock().await[idx] = Some(tx);

        let state = Arc::clone(&state);
        let sibling = Arc::clone(&sibling);
        tokio::spawn(async move {
            vm_connection_task(idx, conn, rx, state, sibling).await;
        });
    }
}

async fn vm_connection_task(
    idx: usize,
    mut conn: Connection,
    mut inject_rx: mpsc::UnboundedReceiver<NetMsg>,
    state: Arc<EngineState>,
    sibling: Arc<IpcChannel>,
) {
    loop {
        tokio::select! {
            to_send = inject_rx.recv() => {
                match to_send {
                    Some(msg) => {
                        conn.send(msg);
                        if let Err(e) = conn.flush().await {
                            error!("sending to vm slot {idx}: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
            recv = conn.recv_message(VM_TIMEOUT) => {
                match recv {
                    Ok(RecvOutcome::Message(mut msg)) => {
                        if msg.error.is_some() {
                            warn!("vm slot {idx} sent invalid message: {:?}", msg.error);
                            continue;
                        }
                        let opcode = msg.opcode();
                        let label = opcode.needs_label().then(|| msg.getlabel().ok()).flatten();
                        let data = opcode.needs_data().then(|| msg.getdata().ok()).flatten();
                        handle_vm_dispatch(idx, opcode, label, data, &state, &sibling).await;
                    }
                    Ok(RecvOutcome::Pending) => {}
                    Ok(RecvOutcome::UnknownOpcode(b)) => {
                        warn!("vm slot {idx} sent unknown opcode {b}");
                    }
                    Ok(RecvOutcome::Eof) => {
                        info!("vm slot {idx} connection closed");
                        finish_job(idx, false, &state, &sibling).await;
                        break;
                    }
                    Ok(RecvOutcome::Timeout) => {
                        match state.pool.lock().await.heartbeat_tick(idx) {
                            wdvm::HeartbeatAction::None => {}
                            wdvm::HeartbeatAction::Send => {
                                if let Ok(hb) = wdvm::message::heartbeat() {
                                    conn.send(hb);
                                    let _ = conn.flush().await;
                                }
                            }
                            wdvm::HeartbeatAction::ReapUngraceful => {
                                warn!("vm slot {idx} missed heartbeat, reaping");
                                finish_job(idx, false, &state, &sibling).await;
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        error!("fatal vm connection error on slot {idx}: {e}");
                        finish_job(idx, false, &state, &sibling).await;
                        break;
                    }
                }
            }
        }
    }
    state.slot_inject.lock().await[idx] = None;
}

async fn handle_vm_dispatch(
    idx: usize,
    opcode: Opcode,
    label: Option<String>,
    data: Option<Vec<u8>>,
    state: &Arc<EngineState>,
    sibling: &Arc<IpcChannel>,
) {
    let dispatch = match state.pool.lock().await.handle_message(idx, opcode, label, data) {
        Ok(d) => d,
        Err(e) => {
            warn!("dispatching vm message on slot {idx}: {e}");
            return;
        }
    };

    let key = match state.pool.lock().await.key(idx) {
        Some(k) => k,
        None => return,
    };

    match dispatch {
        Dispatch::Event(VmEvent::Print(text)) => {
            send_to_frontend(sibling, IpcFrame::new(MessageType::SendLine, key, text)).await;
        }
        Dispatch::Event(VmEvent::ReadLine) => {
            send_to_frontend(sibling, IpcFrame::new(MessageType::RequestLine, key, "")).await;
        }
        Dispatch::Event(VmEvent::CommitFile { label, data }) => {
            match state.writeback.writeback(&label, &data) {
                Ok(path) => {
                    if let Err(e) = state.pool.lock().await.set_writeback_aux(idx, path.clone()) {
                        warn!("recording writeback aux for slot {idx}: {e}");
                    }
                    send_to_frontend(
                        sibling,
                        IpcFrame::new(MessageType::SendFile, key, path.to_string_lossy().into_owned()),
                    )
                    .await;
                }
                Err(e) => warn!("writing back file from vm slot {idx}: {e}"),
            }
        }
        Dispatch::Event(VmEvent::SignalDone) | Dispatch::Event(VmEvent::ReportError(_)) => {
            // handle_message never produces these directly; reap does.
        }
        Dispatch::Terminated => {
            finish_job(idx, true, state, sibling).await;
        }
        Dispatch::Ignored => {}
    }
}

/// Release a slot (reaping first if needed) and forward whatever event
/// that produces to the frontend.
async fn finish_job(idx: usize, graceful: bool, state: &Arc<EngineState>, sibling: &Arc<IpcChannel>) {
    let key = state.pool.lock().await.key(idx);
    let event = match state.pool.lock().await.release(idx, graceful).await {
        Ok(ev) => ev,
        Err(e) => {
            error!("releasing vm slot {idx}: {e}");
            return;
        }
    };

    if let Some(key) = key {
        state.key_to_slot.lock().await.remove(&key);
        match event {
            Some(VmEvent::SignalDone) => {
                send_to_frontend(sibling, IpcFrame::new(MessageType::RequestTerm, key, "")).await;
            }
            Some(VmEvent::ReportError(msg)) => {
                send_to_frontend(sibling, IpcFrame::new(MessageType::Error, key, msg)).await;
            }
            _ => {}
        }
    }
}

async fn send_to_frontend(sibling: &IpcChannel, frame: IpcFrame) {
    if let Err(e) = sibling.send_frame(&frame).await {
        error!("sending ipc frame to frontend: {e}");
    }
}

/// Main dispatch loop for frames arriving from the frontend.
pub async fn run_frame_loop(state: Arc<EngineState>, sibling: Arc<IpcChannel>) {
    loop {
        let frame = match sibling.recv_frame().await {
            Ok(f) => f,
            Err(e) => {
                error!("ipc channel from frontend closed: {e}");
                return;
            }
        };
        handle_frame(frame, &state, &sibling).await;
    }
}

async fn handle_frame(frame: IpcFrame, state: &Arc<EngineState>, sibling: &Arc<IpcChannel>) {
    match frame.msg_type {
        MessageType::PutArchive => on_put_archive(frame.key, frame.payload, state, sibling).await,
        MessageType::SendLine => {
            match state.key_to_slot.lock().await.get(&frame.key).copied() {
                Some(idx) => {
                    if let Ok(msg) = wdvm::message::line(&frame.payload) {
                        state.inject(idx, msg).await;
                    }
                }
                None => warn!("{}", Error::UnknownKey(frame.key.0)),
            }
        }
        MessageType::ClientAck => {
            match state.key_to_slot.lock().await.get(&frame.key).copied() {
                Some(idx) => {
                    if let Some(path) = state.pool.lock().await.take_writeback_aux(idx) {
                        let _ = state.writeback.teardown(&path);
                    }
                    if let Ok(msg) = wdvm::message::ack() {
                        state.inject(idx, msg).await;
                    }
                }
                None => warn!("{}", Error::UnknownKey(frame.key.0)),
            }
        }
        MessageType::Terminate => {
            match state.key_to_slot.lock().await.get(&frame.key).copied() {
                Some(idx) => {
                    if let Some(path) = state.pool.lock().await.take_writeback_aux(idx) {
                        let _ = state.writeback.teardown(&path);
                    }
                    finish_job(idx, true, state, sibling).await;
                }
                None => warn!("{}", Error::UnknownKey(frame.key.0)),
            }
        }
        other => warn!("engine received unexpected frame type {other:?} for key {}", frame.key),
    }
}

async fn on_put_archive(key: BackendKey, path: String, state: &Arc<EngineState>, sibling: &Arc<IpcChannel>) {
    let idx = match state.pool.lock().await.claim(key) {
        Ok(idx) => idx,
        Err(e) => {
            send_to_frontend(
                sibling,
                IpcFrame::new(MessageType::Error, key, format!("no vm available: {e}")),
            )
            .await;
            return;
        }
    };
    state.key_to_slot.lock().await.insert(key, idx);

    let loaded = NetMsg::load_weakly(&path, &state.emessages).and_then(|mut m| {
        let label = m.getlabel()?;
        let data = m.getdata()?;
        Ok((label, data))
    });

    match loaded {
        Ok((label, data)) => match wdvm::message::file(&state.emessages, &label, &data) {
            Ok(msg) => {
                state.inject(idx, msg).await;
                send_to_frontend(sibling, IpcFrame::new(MessageType::Initialized, key, "")).await;
            }
            Err(e) => {
                warn!("building vm-bound archive message for key {key}: {e}");
                finish_job(idx, true, state, sibling).await;
            }
        },
        Err(e) => {
            // the frontend may have already torn down its retained
            // SENDFILE by the time we get here; tolerated, not fatal.
            warn!("loading archive for key {key} from {path}: {e}");
            send_to_frontend(
                sibling,
                IpcFrame::new(MessageType::Error, key, "archive no longer available"),
            )
            .await;
            finish_job(idx, true, state, sibling).await;
        }
    }
}

