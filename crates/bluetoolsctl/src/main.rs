//! bluetoolsctl - command line front end of the bluetools library
//!
//! Most commands need access to raw HCI or L2CAP sockets, which usually
//! means running as root or with CAP_NET_RAW.

use bluetools::gap::{AddressType, BdAddr, Device, DeviceRegistry};
use bluetools::hci::constants::LE_SCAN_PASSIVE;
use bluetools::hci::{HciController, LeScanParameters, RssiSample};
use bluetools::l2cap::handler::trim_nul;
use bluetools::l2cap::{Defaults, L2capClient, L2capServer, DEFAULT_REQUEST, STOP};
use bluetools::Config;
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::env;
use std::error::Error;
use std::fmt::Display;
use std::fs::File;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const USAGE: &str = "\
Usage: bluetoolsctl [--config FILE] [--adapter ADDR] <command> [options]

Commands:
  info                               LE features, supported states and white list size
  scan [DURATION] [MAX]              Classic inquiry (DURATION in units of 1.28 s)
  name ADDR                          Resolve the name of a remote device
  rssi [--target ADDR] [--duration N] [--max N] [--out FILE]
                                     RSSI of classic devices
  le-rssi [--target ADDR] [--max N] [--passive] [--out FILE]
                                     RSSI of LE advertisers
  whitelist add|remove ADDR [--random]
  whitelist clear|size
  serve [--psm N] [--clients N] [--timeout MS] [--requests N]
                                     Run an echo L2CAP server
  send ADDR [--psm N] [--count N] [--timeout MS]
                                     Send requests to an L2CAP server, then STOP
  help

The configuration file defaults to $BLUETOOLS_CONFIG.";

/// Options taking no value
const FLAGS: &[&str] = &["passive", "random"];

/// Request type sent to end a session
const KIND_STOP: u8 = 1;

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Debug, Default)]
struct Args {
    command: String,
    positional: Vec<String>,
    options: HashMap<String, String>,
    flags: HashSet<String>,
}

impl Args {
    fn parse(raw: impl IntoIterator<Item = String>) -> Result<Self, String> {
        let mut args = Args::default();
        let mut raw = raw.into_iter();

        while let Some(arg) = raw.next() {
            if let Some(name) = arg.strip_prefix("--") {
                if FLAGS.contains(&name) {
                    args.flags.insert(name.to_string());
                    continue;
                }
                let value = raw
                    .next()
                    .ok_or_else(|| format!("option --{} needs a value", name))?;
                args.options.insert(name.to_string(), value);
            } else if args.command.is_empty() {
                args.command = arg;
            } else {
                args.positional.push(arg);
            }
        }

        if args.command.is_empty() {
            args.command = "help".to_string();
        }
        Ok(args)
    }

    fn flag(&self, name: &str) -> bool {
        self.flags.contains(name)
    }

    fn option<T>(&self, name: &str) -> Result<Option<T>, String>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.options
            .get(name)
            .map(|value| parse_value(name, value))
            .transpose()
    }

    fn positional<T>(&self, index: usize, name: &str) -> Result<Option<T>, String>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.positional
            .get(index)
            .map(|value| parse_value(name, value))
            .transpose()
    }

    fn required<T>(&self, index: usize, name: &str) -> Result<T, String>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.positional(index, name)?
            .ok_or_else(|| format!("missing {}", name))
    }
}

fn parse_value<T>(name: &str, value: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|err| format!("invalid {} '{}': {}", name, value, err))
}

fn open_controller(config: &Config, args: &Args) -> CliResult<HciController> {
    let adapter: Option<BdAddr> = args.option("adapter")?;
    let registry = Arc::new(DeviceRegistry::new());
    let controller = HciController::open_with_config(
        registry,
        adapter.as_ref(),
        Some("bluetoolsctl"),
        config.hci.clone(),
    )?;
    info!("Using adapter hci{}: {}", controller.dev_id(), controller.device());
    Ok(controller)
}

/// Output file for RSSI samples, if `--out` was given
fn open_sink(args: &Args) -> CliResult<Option<File>> {
    let path: Option<String> = args.option("out")?;
    Ok(path.map(File::create).transpose()?)
}

fn print_samples(samples: &[RssiSample]) {
    for sample in samples {
        println!("{}  {} dBm", sample.address, sample.rssi);
    }
    println!("{} sample(s)", samples.len());
}

fn cmd_info(config: &Config, args: &Args) -> CliResult<()> {
    let controller = open_controller(config, args)?;
    println!("Adapter: {}", controller.device());

    match controller.le_read_local_supported_features(None) {
        Ok(features) => print!("{}", features),
        Err(err) => warn!("Unable to read LE features: {}", err),
    }
    match controller.le_read_supported_states(None) {
        Ok(states) => print!("{}", states),
        Err(err) => warn!("Unable to read LE states: {}", err),
    }
    println!("White list size: {}", controller.le_white_list_size(None)?);

    controller.close()?;
    Ok(())
}

fn cmd_scan(config: &Config, args: &Args) -> CliResult<()> {
    let duration: u8 = args.positional(0, "duration")?.unwrap_or(8);
    let max_rsp: u8 = args.positional(1, "max responses")?.unwrap_or(255);

    let controller = open_controller(config, args)?;
    let devices = controller.scan_devices(None, duration, max_rsp)?;
    for device in &devices {
        println!("{}", device);
    }
    println!("{} device(s) found", devices.len());

    controller.close()?;
    Ok(())
}

fn cmd_name(config: &Config, args: &Args) -> CliResult<()> {
    let address: BdAddr = args.required(0, "address")?;

    let controller = open_controller(config, args)?;
    println!("{}", controller.resolve_remote_name(None, &address)?);
    controller.close()?;
    Ok(())
}

fn cmd_rssi(config: &Config, args: &Args) -> CliResult<()> {
    let target: Option<BdAddr> = args.option("target")?;
    let duration: u8 = args.option("duration")?.unwrap_or(8);
    let max_rsp: u8 = args.option("max")?.unwrap_or(255);
    let mut file = open_sink(args)?;

    let controller = open_controller(config, args)?;
    let samples = controller.measure_rssi(
        None,
        file.as_mut().map(|file| file as &mut dyn Write),
        target.as_ref(),
        duration,
        max_rsp,
    )?;
    print_samples(&samples);

    controller.close()?;
    Ok(())
}

fn cmd_le_rssi(config: &Config, args: &Args) -> CliResult<()> {
    let target: Option<BdAddr> = args.option("target")?;
    let max_rsp: usize = args.option("max")?.unwrap_or(0);
    let mut params = LeScanParameters::default();
    if args.flag("passive") {
        params.scan_type = LE_SCAN_PASSIVE;
    }
    let mut file = open_sink(args)?;

    let controller = open_controller(config, args)?;
    let samples = controller.le_measure_rssi(
        None,
        file.as_mut().map(|file| file as &mut dyn Write),
        target.as_ref(),
        max_rsp,
        &params,
    )?;
    print_samples(&samples);

    if controller.is_interrupted() {
        warn!("Scanning could not be disabled, trying again");
        controller.resolve_interruption(None)?;
    }
    controller.close()?;
    Ok(())
}

fn cmd_whitelist(config: &Config, args: &Args) -> CliResult<()> {
    let action: String = args.required(0, "white list action")?;
    let address_type = if args.flag("random") {
        AddressType::Random
    } else {
        AddressType::Public
    };

    let controller = open_controller(config, args)?;
    match action.as_str() {
        "add" => {
            let address: BdAddr = args.required(1, "address")?;
            let device = Device::new(address, address_type, None, None);
            controller.le_add_white_list(None, &device)?;
            println!("{} added", address);
        }
        "remove" => {
            let address: BdAddr = args.required(1, "address")?;
            let device = Device::new(address, address_type, None, None);
            controller.le_remove_white_list(None, &device)?;
            println!("{} removed", address);
        }
        "clear" => {
            controller.le_clear_white_list(None)?;
            println!("White list cleared");
        }
        "size" => println!("{}", controller.le_white_list_size(None)?),
        other => return Err(format!("unknown white list action '{}'", other).into()),
    }

    controller.close()?;
    Ok(())
}

fn cmd_serve(config: &Config, args: &Args) -> CliResult<()> {
    let l2cap = &config.l2cap;
    let adapter: Option<BdAddr> = args.option("adapter")?;
    let psm: u16 = args.option("psm")?.unwrap_or(l2cap.psm);
    let max_clients: usize = args.option("clients")?.unwrap_or(l2cap.max_clients);
    let timeout = args
        .option::<u64>("timeout")?
        .map(Duration::from_millis)
        .or_else(|| l2cap.poll_timeout());
    let max_requests: Option<usize> = args.option("requests")?.or(l2cap.max_requests);

    let mut server = L2capServer::create(
        adapter.as_ref(),
        psm,
        max_clients,
        l2cap.buffer_capacity,
        Defaults,
        Defaults,
    )?;
    println!("Serving on psm 0x{:04X} for up to {} client(s)", psm, max_clients);

    let reports = server.launch(timeout, max_requests)?;
    for report in &reports {
        let ending = if report.stopped { "stopped" } else { "dropped" };
        println!(
            "Client {} ({}): {} request(s), {}",
            report.peer.slot, report.peer.address, report.requests, ending
        );
    }

    server.close();
    Ok(())
}

fn cmd_send(config: &Config, args: &Args) -> CliResult<()> {
    let l2cap = &config.l2cap;
    let server: BdAddr = args.required(0, "server address")?;
    let psm: u16 = args.option("psm")?.unwrap_or(l2cap.psm);
    let count: usize = args.option("count")?.unwrap_or(1);
    let timeout = args
        .option::<u64>("timeout")?
        .map(Duration::from_millis)
        .or_else(|| l2cap.poll_timeout());

    let mut client = L2capClient::create(
        &server,
        psm,
        l2cap.buffer_capacity,
        |response: &[u8]| println!("< {}", String::from_utf8_lossy(trim_nul(response))),
        |kind: u8| {
            if kind == KIND_STOP {
                STOP.to_vec()
            } else {
                DEFAULT_REQUEST.to_vec()
            }
        },
    )?;
    client.connect()?;

    for _ in 0..count {
        client.send(timeout, 0)?;
    }
    if let Err(err) = client.send(timeout, KIND_STOP) {
        warn!("Server did not acknowledge STOP: {}", err);
    }

    client.close()?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse(env::args().skip(1))?;
    if args.command == "help" {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = match args.option::<String>("config")? {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_filter.as_str()),
    )
    .init();

    match args.command.as_str() {
        "info" => cmd_info(&config, &args),
        "scan" => cmd_scan(&config, &args),
        "name" => cmd_name(&config, &args),
        "rssi" => cmd_rssi(&config, &args),
        "le-rssi" => cmd_le_rssi(&config, &args),
        "whitelist" => cmd_whitelist(&config, &args),
        "serve" => cmd_serve(&config, &args),
        "send" => cmd_send(&config, &args),
        other => {
            eprintln!("{}", USAGE);
            Err(format!("unknown command '{}'", other).into())
        }
    }
}
