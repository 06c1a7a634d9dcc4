use brainstem::outbound::ParsedLine;
use brainstem::params::ParamKey;
use brainstem::protocol::append_checksum;
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8250";
const REPLY_TIMEOUT: Duration = Duration::from_millis(1500);
const COLLECT_WINDOW: Duration = Duration::from_millis(500);

type Error = Box<dyn std::error::Error>;

struct Options<'a> {
    host: &'a str,
    port: u16,
    format: &'a str,
    crc: bool,
    verbose: bool,
}

/// What to wait for after sending a line.
enum Expect {
    /// The first line whose kind is in the list.
    Reply(&'static [&'static str]),
    /// Everything that arrives within the collection window.
    Window,
    Nothing,
}

fn parse_validator<T: std::str::FromStr>(message: &'static str) -> impl Fn(String) -> Result<(), String> {
    move |v| match v.trim().parse::<T>() {
        Ok(_) => Ok(()),
        Err(_) => Err(message.into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let param_keys: Vec<&str> = ParamKey::ALL.iter().map(|key| key.as_str()).collect();

    let matches = App::new("brainstem-ctl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Operator console for the brainstem host link")
        .setting(AppSettings::AllowNegativeNumbers)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Daemon host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Daemon port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true)
                .validator(parse_validator::<u16>("Port must be a number between 0 and 65535")),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json", "raw"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("crc")
                .long("crc")
                .help("Append a *HH checksum to every line sent")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Echo the lines sent")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("ping")
                .about("Round-trip a PING")
                .arg(Arg::with_name("seq").help("Sequence number").default_value("1")
                    .validator(parse_validator::<u32>("seq must be an unsigned integer"))),
        )
        .subcommand(
            SubCommand::with_name("twist")
                .about("Send one velocity command")
                .setting(AppSettings::AllowNegativeNumbers)
                .arg(Arg::with_name("vx").help("Linear velocity, m/s").required(true)
                    .validator(parse_validator::<f32>("vx must be a number")))
                .arg(Arg::with_name("wz").help("Angular velocity, rad/s").required(true)
                    .validator(parse_validator::<f32>("wz must be a number")))
                .arg(Arg::with_name("seq").help("Sequence number").default_value("1")
                    .validator(parse_validator::<u32>("seq must be an unsigned integer"))),
        )
        .subcommand(
            SubCommand::with_name("safe")
                .about("Arm or disarm the safety layer (off holds the e-stop)")
                .arg(Arg::with_name("state").required(true).possible_values(&["on", "off"])),
        )
        .subcommand(
            SubCommand::with_name("set")
                .about("Set a runtime parameter")
                .arg(Arg::with_name("key").required(true).possible_values(&param_keys))
                .arg(Arg::with_name("value").required(true)),
        )
        .subcommand(
            SubCommand::with_name("get")
                .about("Read a runtime parameter")
                .arg(Arg::with_name("key").required(true).possible_values(&param_keys)),
        )
        .subcommand(
            SubCommand::with_name("event")
                .about("Fetch one retained event by id")
                .arg(Arg::with_name("eid").required(true)
                    .validator(parse_validator::<u32>("eid must be an unsigned integer"))),
        )
        .subcommand(
            SubCommand::with_name("replay")
                .about("Re-deliver every retained event newer than an id")
                .arg(Arg::with_name("since").default_value("0")
                    .validator(parse_validator::<u32>("since must be an unsigned integer"))),
        )
        .subcommand(SubCommand::with_name("stats").about("Show link and decoder counters"))
        .subcommand(SubCommand::with_name("pause").about("Suppress rate-limited telemetry"))
        .subcommand(SubCommand::with_name("resume").about("Resume rate-limited telemetry"))
        .subcommand(
            SubCommand::with_name("led")
                .about("Set the indicator bitmask")
                .arg(Arg::with_name("mask").required(true)
                    .validator(parse_validator::<u8>("mask must be 0-255"))),
        )
        .subcommand(
            SubCommand::with_name("raw")
                .about("Send a raw protocol line and show what comes back")
                .arg(Arg::with_name("line").required(true)),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("Stream every line the daemon sends")
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("Stop after this many seconds (default: until Ctrl+C)")
                        .takes_value(true)
                        .validator(parse_validator::<u64>("duration must be whole seconds")),
                ),
        )
        .get_matches();

    let opts = Options {
        host: matches.value_of("host").unwrap_or(DEFAULT_HOST),
        port: matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?,
        format: matches.value_of("format").unwrap_or("table"),
        crc: matches.is_present("crc"),
        verbose: matches.is_present("verbose"),
    };

    let (line, expect) = match matches.subcommand() {
        ("ping", Some(sub)) => (format!("PING,{}", arg(sub, "seq")), Expect::Reply(&["PONG", "ERR"])),
        ("twist", Some(sub)) => (
            format!("TWIST,{},{},{}", arg(sub, "vx"), arg(sub, "wz"), arg(sub, "seq")),
            Expect::Nothing,
        ),
        ("safe", Some(sub)) => {
            let flag = if arg(sub, "state") == "on" { 1 } else { 0 };
            (format!("SAFE,{}", flag), Expect::Reply(&["ACK", "ERR"]))
        }
        ("set", Some(sub)) => (
            format!("SET,{},{}", arg(sub, "key"), arg(sub, "value")),
            Expect::Reply(&["ACK", "ERR"]),
        ),
        ("get", Some(sub)) => (format!("GET,{}", arg(sub, "key")), Expect::Reply(&["ACK", "ERR"])),
        ("event", Some(sub)) => (format!("GET,evt,{}", arg(sub, "eid")), Expect::Window),
        ("replay", Some(sub)) => (format!("REPLAY,{}", arg(sub, "since")), Expect::Window),
        ("stats", _) => ("STATS".to_string(), Expect::Reply(&["STATS"])),
        ("pause", _) => ("PAUSE".to_string(), Expect::Nothing),
        ("resume", _) => ("RESUME".to_string(), Expect::Nothing),
        ("led", Some(sub)) => (format!("LED,{}", arg(sub, "mask")), Expect::Reply(&["ACK", "ERR"])),
        ("raw", Some(sub)) => (arg(sub, "line").to_string(), Expect::Window),
        ("monitor", Some(sub)) => {
            let duration = sub.value_of("duration").and_then(|d| d.parse().ok()).map(Duration::from_secs);
            return monitor(&opts, duration).await;
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Start the daemon", "brainstem".bright_cyan());
            println!("  {} Check the link", "brainstem-ctl ping".bright_cyan());
            println!("  {} Watch telemetry", "brainstem-ctl monitor".bright_cyan());
            return Ok(());
        }
    };

    let (mut lines, mut writer) = connect(&opts).await?;
    let wire = if opts.crc { append_checksum(&line) } else { line };
    if opts.verbose {
        println!("{} {}", ">>".dimmed(), wire.dimmed());
    }
    writer.write_all(wire.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    match expect {
        Expect::Nothing => println!("{} {}", "sent".bright_green(), wire),
        Expect::Reply(kinds) => {
            let deadline = Instant::now() + REPLY_TIMEOUT;
            loop {
                match time::timeout_at(deadline, lines.next_line()).await {
                    Ok(Ok(Some(received))) => {
                        let is_reply = ParsedLine::parse(&received)
                            .is_some_and(|parsed| kinds.contains(&parsed.kind.as_str()));
                        if is_reply {
                            print_line(&received, opts.format);
                            break;
                        }
                        if opts.verbose {
                            print_line(&received, opts.format);
                        }
                    }
                    Ok(Ok(None)) => {
                        eprintln!("{} daemon closed the connection", "!!".red());
                        break;
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => {
                        eprintln!("{} no reply within {:?}", "!!".red(), REPLY_TIMEOUT);
                        break;
                    }
                }
            }
        }
        Expect::Window => {
            let deadline = Instant::now() + COLLECT_WINDOW;
            while let Ok(Ok(Some(received))) = time::timeout_at(deadline, lines.next_line()).await {
                print_line(&received, opts.format);
            }
        }
    }

    Ok(())
}

fn arg<'a>(matches: &'a ArgMatches<'_>, name: &str) -> &'a str {
    matches.value_of(name).unwrap_or_default()
}

async fn connect(
    opts: &Options<'_>,
) -> Result<(Lines<BufReader<OwnedReadHalf>>, tokio::net::tcp::OwnedWriteHalf), Error> {
    let addr = format!("{}:{}", opts.host, opts.port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{} Failed to connect to brainstem at {}", "!!".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("   Start the daemon with {}", "brainstem".bright_cyan());
            }
            return Err(e.into());
        }
    };
    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader).lines(), writer))
}

async fn monitor(opts: &Options<'_>, duration: Option<Duration>) -> Result<(), Error> {
    println!("{}", "Monitoring host link (Ctrl+C to stop)...".bright_blue().bold());
    let (mut lines, mut writer) = connect(opts).await?;
    // Any valid line claims the link; STATS is harmless
    writer.write_all(b"STATS\n").await?;

    let deadline = duration.map(|d| Instant::now() + d);
    loop {
        let next = match deadline {
            Some(at) => match time::timeout_at(at, lines.next_line()).await {
                Ok(next) => next,
                Err(_) => break,
            },
            None => lines.next_line().await,
        };
        match next? {
            Some(received) => print_line(&received, opts.format),
            None => break,
        }
    }
    Ok(())
}

fn print_line(raw: &str, format: &str) {
    match format {
        "raw" => println!("{}", raw),
        "json" => match ParsedLine::parse(raw).map(|parsed| serde_json::to_string(&parsed)) {
            Some(Ok(json)) => println!("{}", json),
            _ => println!("{}", raw),
        },
        _ => {
            let Some(parsed) = ParsedLine::parse(raw) else {
                return;
            };
            let kind = format!("{:<8}", parsed.kind);
            let kind = match parsed.kind.as_str() {
                "ERR" => kind.bright_red().bold(),
                "ACK" | "PONG" | "HELLO" => kind.bright_green(),
                "STATE" | "LINK" => kind.bright_cyan(),
                "BUMP" | "CLIFF" | "STARTLE" | "ESTOP" | "STALE" => kind.yellow().bold(),
                "ODOM" | "TIME" | "BAT" | "RGMIN" => kind.bright_blue(),
                _ => kind.white(),
            };
            let eid = parsed
                .eid
                .map(|eid| format!("#{}", eid))
                .unwrap_or_default();
            println!("{:>6} {} {}", eid.dimmed(), kind, parsed.fields.join(" "));
        }
    }
}
