//! CLI surface for the `workerd` binary. Kept intentionally small — the
//! original accepts three bare flags; everything else that would
//! reasonably be a flag in a production daemon (listen ports, chroot
//! target, pool size, `vmctl` path) is exposed too, with defaults that
//! match the filesystem layout and ports named in the external interface.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "workerd", about = "VM-pool job worker daemon")]
pub struct Args {
    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Increase log verbosity (-v, -vv, ...).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// User to drop privileges to after binding sockets.
    #[arg(long, default_value = "_workerd")]
    pub user: String,

    /// Directory to chroot into after binding sockets.
    #[arg(long, default_value = "/var/workerd")]
    pub chroot: PathBuf,

    /// Client-facing TLS listen port.
    #[arg(long, default_value_t = 443)]
    pub client_port: u16,

    /// VM-facing plain TCP listen port.
    #[arg(long, default_value_t = 8123)]
    pub vm_port: u16,

    #[arg(long, default_value = "/etc/ssl/cert.pem")]
    pub tls_ca: PathBuf,

    #[arg(long, default_value = "/etc/ssl/server.pem")]
    pub tls_cert: PathBuf,

    #[arg(long, default_value = "/etc/ssl/private/server.key")]
    pub tls_key: PathBuf,

    /// Number of VM slots in the pool.
    #[arg(long, default_value_t = 4)]
    pub pool_size: usize,

    #[arg(long, default_value = "/usr/sbin/vmctl")]
    pub vmctl: PathBuf,

    #[arg(long, default_value = "/home/_workerd/base.qcow2")]
    pub base_image: PathBuf,

    #[arg(long, default_value = "/home/_workerd/vivado.qcow2")]
    pub vivado_image: PathBuf,

    #[arg(long, default_value = "template")]
    pub vm_template: String,
}

impl Args {
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }

    pub fn fmessages_dir(&self) -> PathBuf {
        self.chroot.join("fmessages")
    }

    pub fn emessages_dir(&self) -> PathBuf {
        self.chroot.join("emessages")
    }

    pub fn writeback_dir(&self) -> PathBuf {
        self.chroot.join("writeback")
    }

    pub fn disks_dir(&self) -> PathBuf {
        self.chroot.join("disks")
    }
}
