use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use local_scan_bridge::message::{HeaderLine, Message, MessageInfo, Recipient};
use local_scan_bridge::standalone::{self, StandaloneHost};
use local_scan_bridge::{BridgeConfig, FailurePolicy, LocalScanner, Verdict};
use log::LevelFilter;
use serde::Serialize;
use std::fs;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Serialize)]
struct ScanOutcome<'a> {
    message_id: &'a str,
    verdict: &'a Verdict,
    decision: &'a str,
    headers: &'a [HeaderLine],
    recipients: Vec<String>,
}

fn cli() -> Command {
    Command::new("local-scan-bridge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Delegates the MTA's local_scan accept/reject decision to a rhai script")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (built-in defaults when omitted)"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write a default configuration file and exit")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and import the scan module")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("scan")
                .long("scan")
                .value_name("FILE")
                .help("Run the scan function against a message file")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("sender")
                .long("sender")
                .value_name("ADDRESS")
                .help("Envelope sender (defaults to the message's Return-Path)"),
        )
        .arg(
            Arg::new("recipient")
                .short('r')
                .long("recipient")
                .value_name("ADDRESS")
                .help("Envelope recipient, may be repeated")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("sender-host-address")
                .long("sender-host-address")
                .value_name("IP")
                .help("Address of the sending host; omit for a locally submitted message"),
        )
        .arg(
            Arg::new("failure-policy")
                .long("failure-policy")
                .value_name("POLICY")
                .help("Override the failure policy (accept, defer, deny)"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print the scan outcome as JSON")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging, including script debug output")
                .action(ArgAction::SetTrue),
        )
}

fn main() {
    let matches = cli().get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => match BridgeConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading configuration: {e:#}");
                process::exit(1);
            }
        },
        None => BridgeConfig::default(),
    };

    if let Some(policy) = matches.get_one::<String>("failure-policy") {
        match policy.parse::<FailurePolicy>() {
            Ok(policy) => config.failure_policy = policy,
            Err(e) => {
                eprintln!("{e}");
                process::exit(2);
            }
        }
    }

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        config
            .logging
            .as_ref()
            .and_then(|logging| logging.level.parse().ok())
            .unwrap_or(LevelFilter::Info)
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let mut host = match StandaloneHost::new(&config.standalone) {
        Ok(host) => host,
        Err(e) => {
            eprintln!("Error setting up host: {e:#}");
            process::exit(1);
        }
    };
    if host.variable("primary_hostname").is_none() {
        if let Some(name) = hostname() {
            host.set_variable("primary_hostname", name);
        }
    }

    if matches.get_flag("test-config") {
        process::exit(test_config(config, host));
    }

    if let Some(message_file) = matches.get_one::<String>("scan") {
        let options = ScanOptions {
            sender: matches.get_one::<String>("sender").cloned(),
            recipients: matches
                .get_many::<String>("recipient")
                .map(|values| values.cloned().collect())
                .unwrap_or_default(),
            sender_host_address: matches.get_one::<String>("sender-host-address").cloned(),
            json: matches.get_flag("json"),
        };
        if let Err(e) = scan_file(config, host, message_file, options) {
            eprintln!("Error: {e:#}");
            process::exit(1);
        }
        return;
    }

    if let Err(e) = cli().print_help() {
        eprintln!("Error printing help: {e}");
    }
    println!();
    process::exit(2);
}

fn generate_default_config(path: &str) {
    let config = BridgeConfig::default();
    match config.to_file(path) {
        Ok(()) => println!("Default configuration written to: {path}"),
        Err(e) => {
            eprintln!("Error writing configuration file: {e:#}");
            process::exit(1);
        }
    }
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Some(String::from_utf8_lossy(&buf[..end]).into_owned())
}

fn test_config(config: BridgeConfig, host: StandaloneHost) -> i32 {
    println!("Testing configuration...");
    println!("  enabled:        {}", config.enabled);
    println!("  host module:    {}", config.host_module);
    println!("  scan module:    {}", config.scan_module);
    println!("  scan function:  {}", config.scan_function);
    println!("  failure policy: {}", config.failure_policy);
    for path in config.search_paths() {
        println!("  search path:    {}", path.display());
    }

    let problems = config.validate();
    if !problems.is_empty() {
        println!();
        println!("Configuration problems:");
        for problem in &problems {
            println!("  - {problem}");
        }
        return 1;
    }

    let scanner = LocalScanner::new(config, Arc::new(host));
    match scanner.prepare() {
        Ok(path) => {
            println!();
            println!("Scan module imported from {}", path.display());
            0
        }
        Err(e) => {
            println!();
            println!("Scan module failed to load: {e}");
            1
        }
    }
}

struct ScanOptions {
    sender: Option<String>,
    recipients: Vec<String>,
    sender_host_address: Option<String>,
    json: bool,
}

fn scan_file(
    config: BridgeConfig,
    mut host: StandaloneHost,
    message_file: &str,
    options: ScanOptions,
) -> anyhow::Result<()> {
    let content = fs::read_to_string(message_file)
        .with_context(|| format!("Failed to read message file: {message_file}"))?;
    let parsed = standalone::parse_message(&content);

    if options.recipients.is_empty() {
        anyhow::bail!("At least one --recipient is needed to scan a message");
    }

    let message_id = standalone::message_id(SystemTime::now(), process::id());
    let spool = standalone::spool_file(&message_id, &parsed.body)
        .context("Failed to create spool file")?;
    host.set_variable("message_id", message_id.clone());

    let local = options.sender_host_address.is_none();
    let info = MessageInfo {
        debug_selector: i32::from(log::log_enabled!(log::Level::Debug)),
        message_id: message_id.clone(),
        received_protocol: Some(if local { "local" } else { "esmtp" }.to_string()),
        sender_address: options
            .sender
            .or(parsed.return_path)
            .unwrap_or_default(),
        sender_host_address: options.sender_host_address,
        fd: spool.as_raw_fd(),
        ..Default::default()
    };
    let mut message = Message {
        headers: parsed.headers,
        recipients: options.recipients.iter().map(Recipient::new).collect(),
        info,
    };

    log::info!(
        "Scanning {} as {} ({} headers, {} recipients)",
        Path::new(message_file).display(),
        message_id,
        message.headers.len(),
        message.recipients.len()
    );

    let scanner = LocalScanner::new(config, Arc::new(host));
    let verdict = scanner.scan(&mut message);
    drop(spool);

    if options.json {
        let outcome = ScanOutcome {
            message_id: &message_id,
            verdict: &verdict,
            decision: verdict.name(),
            headers: &message.headers,
            recipients: message.recipient_addresses(),
        };
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    println!("Message:    {message_id}");
    println!("Decision:   {verdict}");
    println!();
    println!("Headers:");
    for header in &message.headers {
        let marker = if header.is_deleted() { " (deleted)" } else { "" };
        for (i, line) in header.text.lines().enumerate() {
            if i == 0 {
                println!("  [{}] {line}{marker}", header.kind);
            } else {
                println!("      {line}");
            }
        }
    }
    println!();
    println!("Recipients:");
    for recipient in &message.recipients {
        println!("  {}", recipient.address);
    }

    Ok(())
}
