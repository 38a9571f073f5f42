//! Command line flags and how they override the config file

use std::path::PathBuf;

use clap::Parser;
use xskpump_common::af_xdp::{AttachMode, BindMode, PollMode};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "xskpump")]
#[command(about = "AF_XDP zero-copy packet reflector", long_about = None)]
pub struct Args {
    /// Interface to bind
    #[arg(short = 'i', long = "dev")]
    pub interface: Option<String>,

    /// First NIC queue
    #[arg(short, long)]
    pub queue: Option<u32>,

    /// Number of consecutive queues, one socket each
    #[arg(long)]
    pub queues: Option<u32>,

    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Attach the redirect program in generic (SKB) mode
    #[arg(short = 'S', long, conflicts_with_all = ["native_mode", "auto_mode"])]
    pub skb_mode: bool,

    /// Attach the redirect program in driver mode
    #[arg(short = 'N', long, conflicts_with = "auto_mode")]
    pub native_mode: bool,

    /// Try driver mode, fall back to SKB mode
    #[arg(long)]
    pub auto_mode: bool,

    /// Force copy mode
    #[arg(long, conflicts_with = "zero_copy")]
    pub copy: bool,

    /// Force zero-copy mode
    #[arg(short = 'z', long)]
    pub zero_copy: bool,

    /// Block in poll(2) instead of spinning
    #[arg(short = 'p', long)]
    pub poll_mode: bool,

    /// Register sockets in this pinned XSKMAP instead of loading a program
    #[arg(long)]
    pub xskmap_pin: Option<PathBuf>,

    /// Disable XDP_USE_NEED_WAKEUP
    #[arg(short = 'm', long)]
    pub no_need_wakeup: bool,

    /// TX batch threshold
    #[arg(short = 'b', long)]
    pub batch_size: Option<u32>,

    #[arg(short = 'f', long)]
    pub frame_size: Option<u32>,

    /// Seconds between statistics reports
    #[arg(short = 'n', long)]
    pub stats_interval: Option<u64>,

    #[arg(long)]
    pub quiet: bool,

    #[arg(short, long)]
    pub verbose: bool,

    /// Run against an in-process NIC with generated traffic
    #[arg(long)]
    pub loopback: bool,

    #[arg(short, long, default_value = "xskpump.toml")]
    pub config: String,
}

impl Args {
    /// Apply every flag that was given on top of `config`
    pub fn apply(&self, config: &mut Config) {
        let xdp = &mut config.xdp;

        if let Some(interface) = &self.interface {
            xdp.interface = interface.clone();
        }
        if let Some(queue) = self.queue {
            xdp.first_queue = queue;
        }
        if let Some(queues) = self.queues {
            xdp.queue_count = queues;
        }
        if let Some(workers) = self.workers {
            xdp.workers = workers;
        }

        if self.skb_mode {
            xdp.attach_mode = AttachMode::Skb;
        } else if self.native_mode {
            xdp.attach_mode = AttachMode::Native;
        } else if self.auto_mode {
            xdp.attach_mode = AttachMode::Auto;
        }

        if self.copy {
            xdp.bind_mode = BindMode::Copy;
        } else if self.zero_copy {
            xdp.bind_mode = BindMode::ZeroCopy;
        }

        if self.poll_mode {
            xdp.poll_mode = PollMode::Readiness;
        }
        if let Some(path) = &self.xskmap_pin {
            xdp.xskmap_pin = Some(path.clone());
        }
        if self.no_need_wakeup {
            xdp.need_wakeup = false;
        }
        if let Some(batch) = self.batch_size {
            xdp.tx_batch_size = batch;
        }
        if let Some(frame_size) = self.frame_size {
            xdp.frame_size = frame_size;
        }

        if let Some(interval) = self.stats_interval {
            config.stats_interval = interval;
        }
        if self.quiet {
            config.quiet = true;
        }
    }
}
