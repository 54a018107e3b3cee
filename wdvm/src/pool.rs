//! The VM pool: a fixed array of slots cycling BOOT -> READY -> WORK ->
//! (ZOMBIE ->) BOOT, and the serialized boot queue that keeps at most one
//! `vmctl start` in flight at a time.
//!
//! This owns no network connection objects — the caller (the engine
//! router) keeps its own per-slot connection handle and is told, via
//! `ReapResult`/`Dispatch`, when a slot's connection needs tearing down or
//! a message forwarded to the frontend. That split mirrors the
//! function-table-of-callbacks in `vm_interface` becoming an explicit
//! return value instead of a trait object: this pool has exactly one
//! caller and no plugin points to justify the indirection.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use log::{error, warn};
use wdlib::filestore::FileStore;
use wdlib::netmsg::Opcode;
use wdlib::BackendKey;

use crate::error::{Error, Result};
use crate::vmctl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Boot,
    Ready,
    Work,
    Zombie,
}

struct Slot {
    state: SlotState,
    key: Option<BackendKey>,
    basedisk: PathBuf,
    vivadodisk: PathBuf,
    name: String,
    has_conn: bool,
    should_heartbeat: bool,
    writeback_aux: Option<PathBuf>,
}

impl Slot {
    fn uninitialized() -> Self {
        Slot {
            state: SlotState::Boot,
            key: None,
            basedisk: PathBuf::new(),
            vivadodisk: PathBuf::new(),
            name: String::new(),
            has_conn: false,
            should_heartbeat: false,
            writeback_aux: None,
        }
    }
}

pub struct VmPoolConfig {
    pub vmctl_path: PathBuf,
    pub disks_dir: PathBuf,
    pub base_image: PathBuf,
    pub vivado_image: PathBuf,
    pub template_name: String,
    pub slot_count: usize,
}

/// What a VM sent, translated for the engine router to forward to the
/// frontend (and on to the client).
#[derive(Debug)]
pub enum VmEvent {
    Print(String),
    ReadLine,
    CommitFile { label: String, data: Vec<u8> },
    SignalDone,
    ReportError(String),
}

pub struct ReapResult {
    pub event: Option<VmEvent>,
    pub had_conn: bool,
}

pub enum Dispatch {
    Event(VmEvent),
    /// The VM sent TERMINATE; caller must follow up with `reap(idx, true)`.
    Terminated,
    Ignored,
}

pub enum HeartbeatAction {
    None,
    Send,
    ReapUngraceful,
}

pub struct VmPool {
    cfg: VmPoolConfig,
    slots: Vec<Slot>,
    boot_queue: VecDeque<usize>,
    messages_store: Arc<FileStore>,
}

impl VmPool {
    pub fn new(cfg: VmPoolConfig, messages_store: Arc<FileStore>) -> Self {
        let slots = (0..cfg.slot_count).map(|_| Slot::uninitialized()).collect();
        VmPool {
            cfg,
            slots,
            boot_queue: VecDeque::new(),
            messages_store,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn messages_store(&self) -> &Arc<FileStore> {
        &self.messages_store
    }

    fn check_idx(&self, idx: usize) -> Result<()> {
        if idx >= self.slots.len() {
            Err(Error::BadSlot(idx))
        } else {
            Ok(())
        }
    }

    pub fn state(&self, idx: usize) -> Option<SlotState> {
        self.slots.get(idx).map(|s| s.state)
    }

    pub fn key(&self, idx: usize) -> Option<BackendKey> {
        self.slots.get(idx).and_then(|s| s.key)
    }

    /// Build every slot's overlay disks and queue it for boot. Call once at
    /// startup after the chroot's disk directory has been prepared.
    pub async fn init(&mut self) -> Result<()> {
        for idx in 0..self.slots.len() {
            self.reset(idx).await?;
        }
        Ok(())
    }

    /// Rebuild a slot's overlay disks from the template images and push it
    /// onto the back of the boot queue. If the queue was empty, this slot
    /// becomes the head and its `vmctl start` is issued immediately.
    pub async fn reset(&mut self, idx: usize) -> Result<()> {
        self.check_idx(idx)?;

        let basedisk = vmctl::basedisk_path(&self.cfg.disks_dir, idx);
        let vivadodisk = vmctl::vivadodisk_path(&self.cfg.disks_dir, idx);
        vmctl::create_overlay(&self.cfg.vmctl_path, &self.cfg.base_image, &basedisk).await?;
        vmctl::create_overlay(&self.cfg.vmctl_path, &self.cfg.vivado_image, &vivadodisk).await?;

        let slot = &mut self.slots[idx];
        slot.basedisk = basedisk;
        slot.vivadodisk = vivadodisk;
        slot.name = vmctl::slot_name(idx);
        slot.state = SlotState::Boot;
        slot.key = None;
        slot.has_conn = false;
        slot.should_heartbeat = false;
        slot.writeback_aux = None;

        self.boot_queue.push_back(idx);
        if self.boot_queue.len() == 1 {
            self.start_head().await?;
        }
        Ok(())
    }

    async fn start_head(&mut self) -> Result<()> {
        if let Some(&idx) = self.boot_queue.front() {
            let slot = &self.slots[idx];
            vmctl::start(
                &self.cfg.vmctl_path,
                &self.cfg.template_name,
                &slot.basedisk,
                &slot.vivadodisk,
                &slot.name,
            )
            .await?;
        }
        Ok(())
    }

    /// A VM dialed in on the VM-facing listener: pop the boot queue head,
    /// move it to READY, and kick off the next queued boot (if any).
    pub async fn accept(&mut self) -> Result<Option<usize>> {
        let idx = match self.boot_queue.pop_front() {
            Some(idx) => idx,
            None => return Ok(None),
        };
        self.slots[idx].state = SlotState::Ready;
        self.slots[idx].has_conn = true;
        self.start_head().await?;
        Ok(Some(idx))
    }

    /// Hand a READY slot to a job. Errors with `NoReadySlot` when the pool
    /// is saturated; the caller should surface that as "try again later".
    pub fn claim(&mut self, key: BackendKey) -> Result<usize> {
        let idx = self
            .slots
            .iter()
            .position(|s| s.state == SlotState::Ready)
            .ok_or(Error::NoReadySlot)?;
        let slot = &mut self.slots[idx];
        slot.key = Some(key);
        slot.state = SlotState::Work;
        slot.should_heartbeat = false;
        Ok(idx)
    }

    /// Stop the VM, unlink its disks, and either reset it immediately (it
    /// was never claimed) or park it as ZOMBIE for an explicit `release`
    /// (it was mid-job: the caller still owns cleanup of its own
    /// connection-side state and decides when to let it go).
    pub async fn reap(&mut self, idx: usize, graceful: bool) -> Result<ReapResult> {
        self.check_idx(idx)?;

        let was_boot = self.slots[idx].state == SlotState::Boot;
        let was_work = self.slots[idx].state == SlotState::Work;
        let had_conn = self.slots[idx].has_conn;

        if was_boot {
            self.boot_queue.retain(|&i| i != idx);
        }

        let name = self.slots[idx].name.clone();
        let status = vmctl::stop(&self.cfg.vmctl_path, &name).await?;
        if !status.success() {
            if was_boot {
                warn!("vmctl stop on booting slot {idx} exited with {status}, continuing");
            } else {
                return Err(Error::VmctlFailed(
                    vec!["stop".into(), "-fw".into(), name],
                    status,
                ));
            }
        }

        let _ = std::fs::remove_file(&self.slots[idx].basedisk);
        let _ = std::fs::remove_file(&self.slots[idx].vivadodisk);

        self.slots[idx].has_conn = false;
        self.slots[idx].should_heartbeat = false;

        let event = if was_work {
            Some(if graceful {
                VmEvent::SignalDone
            } else {
                VmEvent::ReportError("vm connection lost".to_string())
            })
        } else {
            None
        };

        if was_work {
            self.slots[idx].state = SlotState::Zombie;
        } else {
            self.reset(idx).await?;
        }

        Ok(ReapResult { event, had_conn })
    }

    /// Finish a job: reap (if not already a zombie) with the given
    /// gracefulness, then put the slot back in rotation. `graceful`
    /// matters only the first time a given job is finished — a slot
    /// already parked in ZOMBIE just gets reset, since its event already
    /// went out whenever it was reaped.
    pub async fn release(&mut self, idx: usize, graceful: bool) -> Result<Option<VmEvent>> {
        self.check_idx(idx)?;
        let event = if self.slots[idx].state != SlotState::Zombie {
            self.reap(idx, graceful).await?.event
        } else {
            None
        };
        self.reset(idx).await?;
        Ok(event)
    }

    /// Shutdown: drain the boot queue and reap every non-zombie slot,
    /// coercing each to WORK first so `reap` parks it instead of
    /// immediately rebuilding overlay disks nobody will use. Tolerant of
    /// individual vmctl failures so one stuck VM doesn't block the rest
    /// of the teardown.
    pub async fn kill_all(&mut self) -> Vec<(usize, Option<VmEvent>, bool)> {
        self.boot_queue.clear();
        let mut results = Vec::with_capacity(self.slots.len());
        for idx in 0..self.slots.len() {
            if self.slots[idx].state == SlotState::Zombie {
                continue;
            }
            self.slots[idx].state = SlotState::Work;
            match self.reap(idx, true).await {
                Ok(r) => results.push((idx, r.event, r.had_conn)),
                Err(e) => {
                    error!("reaping slot {idx} during shutdown: {e}");
                    let had_conn = self.slots[idx].has_conn;
                    self.slots[idx].has_conn = false;
                    results.push((idx, Some(VmEvent::ReportError(e.to_string())), had_conn));
                }
            }
        }
        results
    }

    /// Translate an inbound message from a slot's own VM connection.
    pub fn handle_message(
        &mut self,
        idx: usize,
        opcode: Opcode,
        label: Option<String>,
        data: Option<Vec<u8>>,
    ) -> Result<Dispatch> {
        self.check_idx(idx)?;

        if opcode == Opcode::Heartbeat {
            self.slots[idx].should_heartbeat = false;
            return Ok(Dispatch::Ignored);
        }

        if self.slots[idx].state != SlotState::Work {
            warn!("dropping {opcode:?} from slot {idx} not in WORK state");
            return Ok(Dispatch::Ignored);
        }
        self.slots[idx].should_heartbeat = false;

        Ok(match opcode {
            Opcode::SendLine => Dispatch::Event(VmEvent::Print(
                label.ok_or(wdlib::Error::NoLabel)?,
            )),
            Opcode::RequestLine => Dispatch::Event(VmEvent::ReadLine),
            Opcode::SendFile => Dispatch::Event(VmEvent::CommitFile {
                label: label.ok_or(wdlib::Error::NoLabel)?,
                data: data.ok_or(wdlib::Error::NoData)?,
            }),
            Opcode::Terminate => Dispatch::Terminated,
            Opcode::Ack | Opcode::Error => {
                warn!("unexpected {opcode:?} inbound from vm slot {idx}");
                Dispatch::Ignored
            }
            Opcode::Heartbeat => unreachable!("handled above"),
        })
    }

    /// Called on a slot's idle-timeout tick. The first tick with nothing
    /// heard sends a heartbeat probe and re-arms the timer; a second tick
    /// with no reply in between means the VM is gone.
    pub fn heartbeat_tick(&mut self, idx: usize) -> HeartbeatAction {
        let Some(slot) = self.slots.get_mut(idx) else {
            return HeartbeatAction::None;
        };
        if slot.state != SlotState::Work {
            return HeartbeatAction::None;
        }
        if slot.should_heartbeat {
            HeartbeatAction::ReapUngraceful
        } else {
            slot.should_heartbeat = true;
            HeartbeatAction::Send
        }
    }

    pub fn set_writeback_aux(&mut self, idx: usize, path: PathBuf) -> Result<()> {
        self.check_idx(idx)?;
        self.slots[idx].writeback_aux = Some(path);
        Ok(())
    }

    pub fn take_writeback_aux(&mut self, idx: usize) -> Option<PathBuf> {
        self.slots.get_mut(idx).and_then(|s| s.writeback_aux.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wdlib::key::KeyAllocator;

    // `/bin/true` stands in for vmctl: it exits 0 regardless of args, so
    // the state machine can be exercised without a real hypervisor.
    fn test_pool(dir: &std::path::Path, slots: usize) -> VmPool {
        let cfg = VmPoolConfig {
            vmctl_path: PathBuf::from("/bin/true"),
            disks_dir: dir.join("disks"),
            base_image: dir.join("base.qcow2"),
            vivado_image: dir.join("vivado.qcow2"),
            template_name: "template".to_string(),
            slot_count: slots,
        };
        std::fs::create_dir_all(&cfg.disks_dir).unwrap();
        std::fs::create_dir_all(dir.join("messages")).unwrap();
        let store = Arc::new(FileStore::new(dir.join("messages")));
        VmPool::new(cfg, store)
    }

    #[tokio::test]
    async fn init_queues_every_slot_and_boots_only_the_head() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = test_pool(dir.path(), 3);
        pool.init().await.unwrap();
        assert_eq!(pool.state(0), Some(SlotState::Boot));
        assert_eq!(pool.state(1), Some(SlotState::Boot));
        assert_eq!(pool.state(2), Some(SlotState::Boot));
        assert_eq!(pool.boot_queue.len(), 3);
    }

    #[tokio::test]
    async fn accept_then_claim_then_release_cycles_back_to_boot() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = test_pool(dir.path(), 1);
        pool.init().await.unwrap();

        let idx = pool.accept().await.unwrap().expect("one slot queued");
        assert_eq!(pool.state(idx), Some(SlotState::Ready));

        let mut keys = KeyAllocator::new();
        let key = keys.next();
        let claimed = pool.claim(key).unwrap();
        assert_eq!(claimed, idx);
        assert_eq!(pool.state(idx), Some(SlotState::Work));
        assert_eq!(pool.key(idx), Some(key));

        let event = pool.release(idx, true).await.unwrap();
        assert!(matches!(event, Some(VmEvent::SignalDone)));
        assert_eq!(pool.state(idx), Some(SlotState::Boot));
    }

    #[tokio::test]
    async fn claim_with_no_ready_slot_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = test_pool(dir.path(), 1);
        pool.init().await.unwrap();
        let mut keys = KeyAllocator::new();
        assert!(matches!(pool.claim(keys.next()), Err(Error::NoReadySlot)));
    }

    #[tokio::test]
    async fn handle_message_ignored_outside_work_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = test_pool(dir.path(), 1);
        pool.init().await.unwrap();
        let idx = pool.accept().await.unwrap().unwrap();
        let d = pool
            .handle_message(idx, Opcode::SendLine, Some("hi".into()), None)
            .unwrap();
        assert!(matches!(d, Dispatch::Ignored));
    }

    #[tokio::test]
    async fn handle_message_dispatches_in_work_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = test_pool(dir.path(), 1);
        pool.init().await.unwrap();
        let idx = pool.accept().await.unwrap().unwrap();
        let mut keys = KeyAllocator::new();
        pool.claim(keys.next()).unwrap();

        let d = pool
            .handle_message(idx, Opcode::SendLine, Some("echo hi".into()), None)
            .unwrap();
        assert!(matches!(d, Dispatch::Event(VmEvent::Print(s)) if s == "echo hi"));

        let d = pool.handle_message(idx, Opcode::Terminate, None, None).unwrap();
        assert!(matches!(d, Dispatch::Terminated));
    }

    #[tokio::test]
    async fn heartbeat_tick_sends_once_then_reaps() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = test_pool(dir.path(), 1);
        pool.init().await.unwrap();
        let idx = pool.accept().await.unwrap().unwrap();
        let mut keys = KeyAllocator::new();
        pool.claim(keys.next()).unwrap();

        assert!(matches!(pool.heartbeat_tick(idx), HeartbeatAction::Send));
        assert!(matches!(
            pool.heartbeat_tick(idx),
            HeartbeatAction::ReapUngraceful
        ));
    }

    #[tokio::test]
    async fn kill_all_reaps_every_non_zombie_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = test_pool(dir.path(), 2);
        pool.init().await.unwrap();
        let idx = pool.accept().await.unwrap().unwrap();
        let mut keys = KeyAllocator::new();
        pool.claim(keys.next()).unwrap();

        let results = pool.kill_all().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().any(|(i, ev, _)| *i == idx
            && matches!(ev, Some(VmEvent::SignalDone))));
    }
}
