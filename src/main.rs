use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

#[cfg(unix)]
use anyhow::anyhow;
#[cfg(unix)]
use nix::fcntl::{flock, FlockArg};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use gpsgm::config::SystemConfig;
use gpsgm::controller::{tick_thread_loop, worker_loop, GrandmasterController, TickSlot};
use gpsgm::status::GrandmasterStatus;
use gpsgm::{clock, net, ptp};

#[cfg(unix)]
use gpsgm::gps::GpsReference;
#[cfg(unix)]
use gpsgm::rtc::Ds3231Rtc;

const CONFIG_PATH: &str = "/etc/gpsgm/config.json";
const LOCK_PATH: &str = "/var/run/gpsgm.lock";

/// On-disk configuration: device paths plus the tuning surface.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Config {
    #[serde(default)]
    system: SystemConfig,
}

fn load_config(path: Option<&str>) -> Config {
    let path = path.unwrap_or(CONFIG_PATH);

    if let Ok(content) = std::fs::read_to_string(path) {
        match serde_json::from_str::<Config>(&content) {
            Ok(cfg) => return cfg,
            Err(e) => warn!("Ignoring malformed config {}: {}", path, e),
        }
    }

    // Seed an empty config so the tuning surface is discoverable.
    let cfg = Config::default();
    if let Ok(text) = serde_json::to_string_pretty(&cfg) {
        let _ = std::fs::write(path, text);
    }
    cfg
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "GPS-disciplined IEEE 1588 grandmaster", long_about = None)]
struct Args {
    /// PPS device carrying the GPS pulse
    #[arg(long, default_value = "/dev/pps0")]
    pps: String,

    /// Serial port carrying the NMEA stream
    #[arg(long, default_value = "/dev/ttyS0")]
    serial: String,

    #[arg(long, default_value_t = 9600)]
    baud: u32,

    /// PTP hardware clock to discipline (CLOCK_REALTIME when omitted)
    #[arg(long)]
    phc: Option<String>,

    /// Holdover RTC device
    #[arg(long)]
    rtc: Option<String>,

    /// I2C bus for the RTC aging-offset register
    #[arg(long)]
    rtc_i2c: Option<String>,

    /// PPS device wired to the RTC square-wave output
    #[arg(long)]
    rtc_sqw: Option<String>,

    /// Network interface for the PTP port
    #[arg(short, long)]
    interface: Option<String>,

    #[arg(long, default_value_t = 0)]
    domain: u8,

    #[arg(long, default_value_t = 128)]
    priority1: u8,

    #[arg(long, default_value_t = 128)]
    priority2: u8,

    /// Discipline only; do not transmit PTP
    #[arg(long, default_value_t = false)]
    no_ptp: bool,

    /// Isolated core for the tick thread
    #[arg(long, default_value_t = 2)]
    rt_core: usize,

    #[arg(long)]
    config: Option<String>,
}

fn acquire_singleton_lock() -> Result<File> {
    #[cfg(unix)]
    {
        let file = File::create(LOCK_PATH)
            .map_err(|e| anyhow!("Failed to create lock file {}: {}", LOCK_PATH, e))?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(_) => Ok(file),
            Err(nix::errno::Errno::EAGAIN) => Err(anyhow!(
                "Another instance of gpsgm is already running! (Lockfile: {})",
                LOCK_PATH
            )),
            Err(e) => Err(e.into()),
        }
    }
    #[cfg(not(unix))]
    {
        Ok(File::create("gpsgm.lock")?)
    }
}

/// Put the calling thread on the isolated core at real-time priority.
/// The tick thread must win every scheduling contest near the PPS edge.
#[cfg(unix)]
fn enable_realtime_tick_thread(core: usize) {
    unsafe {
        let param = libc::sched_param { sched_priority: 80 };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) == 0 {
            info!("Tick thread: SCHED_FIFO priority 80");
        } else {
            warn!(
                "Tick thread: failed to set realtime priority: {}. Edge latency will suffer.",
                std::io::Error::last_os_error()
            );
        }
    }

    let mut cpuset = nix::sched::CpuSet::new();
    if cpuset.set(core).is_ok() {
        match nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &cpuset) {
            Ok(_) => info!("Tick thread: pinned to core {}", core),
            Err(e) => warn!("Tick thread: failed to pin to core {}: {}", core, e),
        }
    }
}

#[cfg(unix)]
fn build_ptp_port(args: &Args) -> Result<ptp::PtpPort> {
    let (iface, ip) = net::select_interface(args.interface.as_deref())?;

    let identity = match net::interface_mac(&iface) {
        Some(mac) => ptp::ClockIdentity::from_mac(mac),
        None => {
            warn!("No MAC readable on {}; using a random clock identity", iface);
            ptp::ClockIdentity::random()
        }
    };

    let event = net::create_multicast_socket(ptp::PTP_EVENT_PORT, ip)?;
    let general = net::create_multicast_socket(ptp::PTP_GENERAL_PORT, ip)?;
    info!("PTP port on {} ({}), domain {}", iface, ip, args.domain);

    Ok(ptp::PtpPort::new(
        ptp::PortConfig {
            identity,
            domain: args.domain,
            priority1: args.priority1,
            priority2: args.priority2,
            ..ptp::PortConfig::default()
        },
        event,
        general,
    ))
}

#[cfg(unix)]
fn run_grandmaster(args: Args, running: Arc<AtomicBool>, system: SystemConfig) -> Result<()> {
    let _ = sd_notify::notify(
        false,
        &[sd_notify::NotifyState::Status(
            format!("v{} | Starting...", env!("CARGO_PKG_VERSION")).as_str(),
        )],
    );

    let status_shared = Arc::new(RwLock::new(GrandmasterStatus::default()));

    let local_clock = Arc::new(Mutex::new(clock::PlatformClock::open(args.phc.as_deref())?));
    info!("Local clock control initialized.");

    let rtc = match &args.rtc {
        Some(path) => {
            let dev = Ds3231Rtc::open(path, args.rtc_i2c.as_deref(), args.rtc_sqw.as_deref())?;
            info!("Holdover RTC {} opened.", path);
            Some(Arc::new(Mutex::new(dev)))
        }
        None => {
            warn!("No RTC given; running without holdover oscillator discipline.");
            None
        }
    };

    let publisher = if args.no_ptp {
        None
    } else {
        Some(build_ptp_port(&args)?)
    };

    let reference = GpsReference::open(&args.pps, &args.serial, args.baud)?;
    info!("GPS reference: PPS {} + NMEA {} @ {}", args.pps, args.serial, args.baud);

    let mut controller = GrandmasterController::new(
        local_clock.clone(),
        rtc.clone(),
        publisher,
        status_shared.clone(),
        system,
    );

    let slot = Arc::new(TickSlot::new());

    // Real-time tick thread: PPS wait + clock sampling only.
    let tick_handle = {
        let slot = slot.clone();
        let running = running.clone();
        let core = args.rt_core;
        thread::Builder::new()
            .name("gpsgm-tick".into())
            .spawn(move || {
                enable_realtime_tick_thread(core);
                tick_thread_loop(reference, local_clock, rtc, slot, running);
            })?
    };

    // Status reporter: systemd + periodic log line.
    let status_handle = {
        let status = status_shared.clone();
        let running = running.clone();
        thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_secs(10));
                let s = match status.read() {
                    Ok(s) => s.clone(),
                    Err(_) => break,
                };
                let line = if s.association_locked {
                    format!(
                        "v{} | {} | offset {:+.1}us | steering {:+}ppb",
                        env!("CARGO_PKG_VERSION"),
                        s.servo_mode,
                        s.offset_ns as f64 / 1000.0,
                        s.frequency_total_ppb
                    )
                } else {
                    format!("v{} | {} | acquiring GPS...", env!("CARGO_PKG_VERSION"), s.servo_mode)
                };
                info!("{}", line);
                let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Status(&line)]);
            }
        })
    };

    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]);
    info!("Grandmaster loop running.");

    let result = worker_loop(&mut controller, slot.clone(), running.clone());
    if let Err(e) = &result {
        error!("Fatal fault: {}", e);
    }

    // Deterministic shutdown: stop both helpers, then join.
    running.store(false, Ordering::SeqCst);
    slot.close();
    let _ = tick_handle.join();
    let _ = status_handle.join();

    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
    info!("Grandmaster exiting.");
    result
}

#[cfg(not(unix))]
fn run_grandmaster(_args: Args, _running: Arc<AtomicBool>, _system: SystemConfig) -> Result<()> {
    anyhow::bail!("gpsgm requires Linux PPS/PHC/RTC device interfaces")
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref());

    env_logger::builder()
        .format_timestamp_millis()
        .format_target(false)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    info!("gpsgm v{}", env!("CARGO_PKG_VERSION"));

    let _lock_file = match acquire_singleton_lock() {
        Ok(f) => f,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    run_grandmaster(args, running, config.system)
}
