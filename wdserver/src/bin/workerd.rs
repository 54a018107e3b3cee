//! `workerd`: accepts TLS client connections, hands each an archive off to
//! a pooled VM, and streams the job's SENDLINE/REQUESTLINE/SENDFILE
//! traffic back and forth until TERMINATE. Three OS processes cooperate —
//! parent (supervisor), frontend (client-facing), engine (VM-facing) —
//! connected by the IPC fabric in `fabric.rs`, grounded on `proc.c`'s
//! `proc_startall`/`proc_poststartsetup`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::{broadcast, Mutex};

use wdlib::filestore::FileStore;
use wdlib::writeback::WritebackStore;
use wdserver::config::Args;
use wdserver::connection::{Connection, Transport};
use wdserver::engine::{self, EngineState};
use wdserver::fabric::{self, IpcChannel, IpcFrame, Role};
use wdserver::frontend::{self, ActiveConn, ActiveConnTable};
use wdvm::{VmPool, VmPoolConfig};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level())
        .init();

    if !nix::unistd::Uid::effective().is_root() {
        anyhow::bail!("workerd must start as root to bind privileged resources and chroot");
    }

    prepare_layout(&args)?;

    match fabric::spawn()? {
        Role::Parent {
            frontend_pid,
            engine_pid,
        } => run_parent(&args, frontend_pid, engine_pid),
        Role::Frontend { sibling } => {
            let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
            rt.block_on(run_frontend(args, sibling))
        }
        Role::Engine { sibling } => {
            let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
            rt.block_on(run_engine(args, sibling))
        }
    }
}

/// Build (or reset) the chroot's directory layout. Run once, before the
/// fork, while still at the real filesystem root.
fn prepare_layout(args: &Args) -> anyhow::Result<()> {
    for dir in [
        args.fmessages_dir(),
        args.emessages_dir(),
        args.writeback_dir(),
        args.disks_dir(),
    ] {
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;
    }
    // The parent process chroots here once it has forked off both
    // children; it needs nothing from the real filesystem afterward.
    std::fs::create_dir_all("/var/empty")?;
    Ok(())
}

/// The supervisor: waits on both children, forwards INT/TERM as a clean
/// shutdown signal to each, and exits once both have gone away. Holds no
/// client or VM sockets itself, so it drops to the unprivileged user and
/// an empty chroot right away, same as the original's parent process.
fn run_parent(args: &Args, frontend_pid: nix::unistd::Pid, engine_pid: nix::unistd::Pid) -> anyhow::Result<()> {
    fabric::drop_privileges(&args.user, Path::new("/var/empty"))?;

    unsafe {
        signal::sigaction(
            Signal::SIGINT,
            &signal::SigAction::new(
                SigHandler::Handler(on_shutdown_signal),
                signal::SaFlags::empty(),
                signal::SigSet::empty(),
            ),
        )?;
        signal::sigaction(
            Signal::SIGTERM,
            &signal::SigAction::new(
                SigHandler::Handler(on_shutdown_signal),
                signal::SaFlags::empty(),
                signal::SigSet::empty(),
            ),
        )?;
        signal::sigaction(Signal::SIGHUP, &signal::SigAction::new(SigHandler::SigIgn, signal::SaFlags::empty(), signal::SigSet::empty()))?;
        signal::sigaction(Signal::SIGPIPE, &signal::SigAction::new(SigHandler::SigIgn, signal::SaFlags::empty(), signal::SigSet::empty()))?;
    }

    info!("workerd supervisor up, frontend={frontend_pid} engine={engine_pid}");

    let mut frontend_alive = true;
    let mut engine_alive = true;
    let mut forwarded = false;

    while frontend_alive || engine_alive {
        if SHUTDOWN.load(Ordering::SeqCst) && !forwarded {
            info!("forwarding shutdown to children");
            if frontend_alive {
                let _ = signal::kill(frontend_pid, Signal::SIGTERM);
            }
            if engine_alive {
                let _ = signal::kill(engine_pid, Signal::SIGTERM);
            }
            forwarded = true;
        }

        match waitpid(None, Some(nix::sys::wait::WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                info!("child {pid} exited with {code}");
                mark_dead(pid, frontend_pid, engine_pid, &mut frontend_alive, &mut engine_alive);
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                warn!("child {pid} killed by {sig:?}");
                mark_dead(pid, frontend_pid, engine_pid, &mut frontend_alive, &mut engine_alive);
            }
            Ok(WaitStatus::StillAlive) | Ok(_) => {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            Err(nix::errno::Errno::ECHILD) => break,
            Err(e) => {
                error!("waitpid: {e}");
                break;
            }
        }
    }

    Ok(())
}

fn mark_dead(
    pid: nix::unistd::Pid,
    frontend_pid: nix::unistd::Pid,
    engine_pid: nix::unistd::Pid,
    frontend_alive: &mut bool,
    engine_alive: &mut bool,
) {
    if pid == frontend_pid {
        *frontend_alive = false;
    } else if pid == engine_pid {
        *engine_alive = false;
    }
}

/// Blocks until SIGINT or SIGTERM arrives, silently re-arming on SIGHUP
/// and SIGPIPE instead of letting either kill the process. Matches
/// `workerd.c`'s per-child `proc_handlesigev` registration: INT/TERM are
/// the only signals a child acts on.
async fn wait_for_shutdown() -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigpipe = signal(SignalKind::pipe())?;
    loop {
        tokio::select! {
            _ = sigint.recv() => return Ok(()),
            _ = sigterm.recv() => return Ok(()),
            _ = sighup.recv() => continue,
            _ = sigpipe.recv() => continue,
        }
    }
}

async fn run_frontend(args: Args, sibling: IpcChannel) -> anyhow::Result<()> {
    let acceptor = wdserver::tls::build_acceptor(&args.tls_ca, &args.tls_cert, &args.tls_key)?;
    let listener = TcpListener::bind(("0.0.0.0", args.client_port)).await?;

    fabric::drop_privileges(&args.user, &args.chroot)?;

    let fmessages = Arc::new(FileStore::new("/fmessages"));
    let writeback = Arc::new(WritebackStore::new("/writeback"));
    let sibling = Arc::new(sibling);
    let conns = Arc::new(Mutex::new(ActiveConnTable::new()));
    let routes: Arc<Mutex<HashMap<wdlib::BackendKey, UnboundedSender<IpcFrame>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let sibling = Arc::clone(&sibling);
        let routes = Arc::clone(&routes);
        tokio::spawn(async move {
            route_frames_to_connections(sibling, routes).await;
        });
    }

    info!("frontend listening on :{}", args.client_port);
    loop {
        tokio::select! {
            _ = wait_for_shutdown() => {
                info!("frontend tearing down all connections for shutdown");
                let _ = shutdown_tx.send(());
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("client accept failed: {e}");
                        continue;
                    }
                };

                let tls_stream = match acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("tls handshake with {peer_addr} failed: {e}");
                        continue;
                    }
                };

                // The table only hands out the key space here; the ActiveConn
                // itself moves into its own task below, which owns it for the
                // connection's whole lifetime.
                let conn = Connection::new(Transport::Tls(Box::new(tls_stream)), peer_addr, Arc::clone(&fmessages));
                let key = conns.lock().await.insert(conn);
                let active = conns.lock().await.remove(key).expect("just inserted");

                let (tx, rx) = mpsc::unbounded_channel();
                routes.lock().await.insert(key, tx);

                let sibling = Arc::clone(&sibling);
                let writeback = Arc::clone(&writeback);
                let routes = Arc::clone(&routes);
                let shutdown_rx = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    run_one_connection(active, sibling, rx, writeback, shutdown_rx).await;
                    routes.lock().await.remove(&key);
                });
            }
        }
    }
}

async fn run_one_connection(
    active: ActiveConn,
    sibling: Arc<IpcChannel>,
    inbox: mpsc::UnboundedReceiver<IpcFrame>,
    writeback: Arc<WritebackStore>,
    shutdown: broadcast::Receiver<()>,
) {
    frontend::run_connection(active, &sibling, inbox, &writeback, shutdown).await;
}

async fn route_frames_to_connections(
    sibling: Arc<IpcChannel>,
    routes: Arc<Mutex<HashMap<wdlib::BackendKey, UnboundedSender<IpcFrame>>>>,
) {
    loop {
        let frame = match sibling.recv_frame().await {
            Ok(f) => f,
            Err(e) => {
                error!("ipc channel from engine closed: {e}");
                return;
            }
        };
        let key = frame.key;
        let sent = routes.lock().await.get(&key).map(|tx| tx.send(frame));
        if sent.is_none() {
            warn!("frame for unknown client key {key}, dropping");
        }
    }
}

async fn run_engine(args: Args, sibling: IpcChannel) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", args.vm_port)).await?;

    fabric::drop_privileges(&args.user, &args.chroot)?;

    let emessages = Arc::new(FileStore::new("/emessages"));
    let writeback = WritebackStore::new("/writeback");

    let cfg = VmPoolConfig {
        vmctl_path: args.vmctl.clone(),
        disks_dir: Path::new("/disks").to_path_buf(),
        base_image: args.base_image.clone(),
        vivado_image: args.vivado_image.clone(),
        template_name: args.vm_template.clone(),
        slot_count: args.pool_size,
    };

    let mut pool = VmPool::new(cfg, Arc::clone(&emessages));
    pool.init().await?;

    let state = Arc::new(EngineState::new(pool, writeback, Arc::clone(&emessages), args.pool_size));
    let sibling = Arc::new(sibling);

    info!("engine listening on :{} with {} vm slots", args.vm_port, args.pool_size);

    tokio::select! {
        _ = engine::run_vm_listener(listener, Arc::clone(&state), Arc::clone(&sibling)) => {}
        _ = engine::run_frame_loop(Arc::clone(&state), Arc::clone(&sibling)) => {}
        _ = wait_for_shutdown() => {
            info!("engine shutting down, killing all vm slots");
            let killed = state.pool.lock().await.kill_all().await;
            info!("killed {} vm slot(s)", killed.len());
        }
    }

    Ok(())
}

