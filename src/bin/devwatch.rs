//! devwatch CLI
//!
//! Prints device events as they arrive, or lists devices from sysfs.

use std::process::ExitCode;
use std::time::Duration;

use tracing_subscriber::{fmt, EnvFilter};

use devwatch::{CancelToken, Context, Device, DeviceEvent, EventSource, WatchError, WatchResult};

/// Command-line configuration
struct Config {
    /// Event bus to listen on
    source: EventSource,
    /// Subsystem filters, each with an optional devtype
    subsystems: Vec<(String, Option<String>)>,
    /// Tag filters
    tags: Vec<String>,
    /// Print JSON lines instead of text
    json: bool,
    /// List devices instead of monitoring
    enumerate: bool,
    /// Stop after this long without an event
    timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: EventSource::Udev,
            subsystems: Vec::new(),
            tags: Vec::new(),
            json: false,
            enumerate: false,
            timeout: None,
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    args.get(i + 1).map(String::as_str).unwrap_or_else(|| {
        eprintln!("error: {flag} requires a value");
        std::process::exit(1);
    })
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--source" | "-s" => {
                let name = value(&args, i, "--source");
                config.source = name.parse().unwrap_or_else(|e| {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                });
                i += 2;
            }
            "--subsystem" => {
                let spec = value(&args, i, "--subsystem");
                let (subsystem, devtype) = match spec.split_once(':') {
                    Some((s, t)) => (s.to_string(), Some(t.to_string())),
                    None => (spec.to_string(), None),
                };
                config.subsystems.push((subsystem, devtype));
                i += 2;
            }
            "--tag" => {
                config.tags.push(value(&args, i, "--tag").to_string());
                i += 2;
            }
            "--timeout" => {
                let ms: u64 = value(&args, i, "--timeout").parse().unwrap_or_else(|_| {
                    eprintln!("error: invalid timeout: {}", args[i + 1]);
                    std::process::exit(1);
                });
                config.timeout = Some(Duration::from_millis(ms));
                i += 2;
            }
            "--json" => {
                config.json = true;
                i += 1;
            }
            "--enumerate" | "-e" => {
                config.enumerate = true;
                i += 1;
            }
            "--help" | "-h" => {
                println!("devwatch - Linux device event monitor");
                println!();
                println!("USAGE:");
                println!("    devwatch [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -s, --source <udev|kernel>    Event bus to listen on [default: udev]");
                println!("        --subsystem <S[:TYPE]>    Only report this subsystem (repeatable)");
                println!("        --tag <TAG>               Only report devices with this tag (repeatable)");
                println!("        --timeout <MS>            Exit after MS milliseconds without events");
                println!("        --json                    Print one JSON object per line");
                println!("    -e, --enumerate               List matching devices and exit");
                println!("    -h, --help                    Print help information");
                println!();
                println!("ENVIRONMENT:");
                println!("    SYSFS_PATH                    sysfs mount point [default: /sys]");
                println!("    RUST_LOG                      Log filter [default: devwatch=info]");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    config
}

fn print_device(device: &Device, json: bool) -> WatchResult<()> {
    if json {
        println!("{}", serde_json::to_string(device).map_err(|e| WatchError::Io(e.into()))?);
    } else {
        println!(
            "{:<40} {:<12} {}",
            device.syspath().display(),
            device.subsystem().unwrap_or("-"),
            device.devnode().map_or_else(|| "-".to_string(), |p| p.display().to_string())
        );
    }
    Ok(())
}

fn print_event(event: &DeviceEvent, json: bool) -> WatchResult<()> {
    if json {
        println!("{}", serde_json::to_string(event).map_err(|e| WatchError::Io(e.into()))?);
    } else {
        println!(
            "{} {:<8} {} ({})",
            event.received_at.format("%H:%M:%S%.3f"),
            event.action,
            event.device.devpath(),
            event.device.subsystem().unwrap_or("-")
        );
    }
    Ok(())
}

fn enumerate(ctx: &Context, config: &Config) -> WatchResult<()> {
    let mut enumerator = ctx.new_enumerator();
    for (subsystem, _) in &config.subsystems {
        enumerator = enumerator.match_subsystem(subsystem.clone());
    }

    let devices = enumerator.scan_devices_with(|d| {
        let devtype_ok = config
            .subsystems
            .iter()
            .filter(|(s, _)| Some(s.as_str()) == d.subsystem())
            .all(|(_, t)| t.as_deref().map_or(true, |t| d.devtype() == Some(t)));
        let tag_ok = config.tags.is_empty() || config.tags.iter().any(|t| d.has_tag(t));
        devtype_ok && tag_ok
    })?;

    for device in &devices {
        print_device(device, config.json)?;
    }
    tracing::info!(count = devices.len(), "Enumeration complete");
    Ok(())
}

fn monitor(ctx: &Context, config: &Config) -> WatchResult<()> {
    let mut monitor = ctx.new_monitor(config.source.as_str())?;
    for (subsystem, devtype) in &config.subsystems {
        monitor.add_subsystem_filter(subsystem, devtype.as_deref())?;
    }
    for tag in &config.tags {
        monitor.add_tag_filter(tag)?;
    }
    monitor.commit()?;

    let cancel = CancelToken::new();
    let stream = monitor.start(ctx.monitor_config().poll_timeout, &cancel)?;
    tracing::info!(source = %config.source, "Listening for device events");

    loop {
        let next = match config.timeout {
            Some(timeout) => match stream.recv_timeout(timeout) {
                Err(WatchError::Timeout { .. }) => {
                    tracing::info!("No events before timeout, exiting");
                    break;
                }
                other => other,
            },
            None => stream.recv(),
        };
        match next? {
            Some(event) => print_event(&event, config.json)?,
            None => break,
        }
    }

    monitor.close();
    Ok(())
}

fn main() -> ExitCode {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("devwatch=info")))
        .with_writer(std::io::stderr)
        .init();

    let config = parse_args();
    let ctx = Context::new();

    let result = if config.enumerate {
        enumerate(&ctx, &config)
    } else {
        monitor(&ctx, &config)
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "devwatch failed");
            ExitCode::FAILURE
        }
    }
}
