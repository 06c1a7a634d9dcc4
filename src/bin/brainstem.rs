use brainstem::chassis::{SharedChassis, SimulatedChassis};
use brainstem::engine::{Engine, DEFAULT_TICK_MS};
use brainstem::params::ParamSet;
use brainstem::watchdog::{self, LoopHeartbeat, LOOP_STALL_MS};
use clap::{App, Arg};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload};

const DEFAULT_PORT: &str = "8250";
const DEFAULT_BIND: &str = "127.0.0.1";
const OUTBOUND_BROADCAST_BUFFER_SIZE: usize = 1024;
const HOST_READ_BUFFER_SIZE: usize = 512;

type Chassis = SharedChassis<SimulatedChassis>;
type SharedEngine = Arc<Mutex<Engine<Chassis>>>;

/// Monotonic milliseconds since startup, the only clock the engine sees.
#[derive(Clone, Copy)]
struct Clock {
    started: Instant,
}

impl Clock {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

fn level_for(log_level: u8) -> LevelFilter {
    match log_level {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::WARN,
        2 => LevelFilter::INFO,
        3 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("brainstem")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Robot brainstem daemon: host line protocol over TCP, driving a simulated chassis")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP port for the host link")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .validator(|v| match v.parse::<u16>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Port must be a number between 0 and 65535".into()),
                }),
        )
        .arg(
            Arg::with_name("bind")
                .short("b")
                .long("bind")
                .value_name("ADDR")
                .help("Address to listen on")
                .takes_value(true)
                .default_value(DEFAULT_BIND),
        )
        .arg(
            Arg::with_name("tick-ms")
                .short("t")
                .long("tick-ms")
                .value_name("MS")
                .help("Control loop period in milliseconds")
                .takes_value(true)
                .default_value("20")
                .validator(|v| match v.parse::<u64>() {
                    Ok(ms) if (1..=100).contains(&ms) => Ok(()),
                    _ => Err("Tick period must be between 1 and 100 ms".into()),
                }),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON file with parameter overrides")
                .takes_value(true),
        )
        .get_matches();

    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let bind = matches.value_of("bind").unwrap_or(DEFAULT_BIND).to_string();
    let tick_ms: u64 = match matches.value_of("tick-ms") {
        Some(ms) => ms.parse()?,
        None => DEFAULT_TICK_MS,
    };
    let params: ParamSet = match matches.value_of("config") {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => ParamSet::default(),
    };

    let mut log_level = params.log_level;
    let (filter, reload_handle) = reload::Layer::new(level_for(log_level));
    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();

    let clock = Clock { started: Instant::now() };
    let chassis = SharedChassis::new(SimulatedChassis::new());
    let heartbeat = Arc::new(LoopHeartbeat::new(clock.now_ms()));
    let engine: SharedEngine = Arc::new(Mutex::new(
        Engine::new(chassis.clone(), params, clock.now_ms())?.with_heartbeat(Arc::clone(&heartbeat)),
    ));
    // Runs on its own worker, outside the engine lock
    let loop_watchdog = tokio::spawn(watch_loop(chassis.clone(), heartbeat, clock));
    let (outbound_tx, _) = broadcast::channel::<String>(OUTBOUND_BROADCAST_BUFFER_SIZE);

    let listener = TcpListener::bind((bind.as_str(), port)).await?;
    info!(%bind, port, tick_ms, "host link listening");
    let tcp_server = tokio::spawn(accept_loop(listener, Arc::clone(&engine), outbound_tx.clone(), clock));

    let mut interval = time::interval(Duration::from_millis(tick_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let (lines, level) = {
                    let mut engine = engine.lock().await;
                    let now = clock.now_ms();
                    engine.chassis().lock().advance(now);
                    engine.tick(now);
                    (engine.take_outbound(), engine.params().log_level)
                };

                if level != log_level {
                    match reload_handle.modify(|filter| *filter = level_for(level)) {
                        Ok(()) => info!(level, "log level changed"),
                        Err(e) => warn!("failed to apply log level: {}", e),
                    }
                    log_level = level;
                }

                for line in lines {
                    debug!(%line, "tx");
                    // No subscribers just means no host is connected
                    let _ = outbound_tx.send(line.to_string());
                }
            }
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
        }
    }

    loop_watchdog.abort();
    engine.lock().await.halt();
    tcp_server.abort();
    info!("brainstem stopped");
    Ok(())
}

/// Stop the chassis directly when the control loop misses its heartbeat.
async fn watch_loop(mut chassis: Chassis, heartbeat: Arc<LoopHeartbeat>, clock: Clock) {
    let mut interval = time::interval(Duration::from_millis(LOOP_STALL_MS / 4));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        match watchdog::enforce(&heartbeat, &mut chassis, clock.now_ms()) {
            Ok(true) => warn!(last_beat_ms = heartbeat.last_beat_ms(), "loop watchdog stopped the chassis"),
            Ok(false) => {}
            Err(e) => error!(error = ?e, "loop watchdog failed to stop the chassis"),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    engine: SharedEngine,
    outbound_tx: broadcast::Sender<String>,
    clock: Clock,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!(%addr, "host connected");
                let client_engine = Arc::clone(&engine);
                let outbound_rx = outbound_tx.subscribe();
                tokio::spawn(async move {
                    if let Err(e) = handle_host(stream, client_engine, outbound_rx, clock).await {
                        warn!(%addr, "host link error: {}", e);
                    }
                    info!(%addr, "host disconnected");
                });
            }
            Err(e) => error!("failed to accept connection: {}", e),
        }
    }
}

async fn handle_host(
    stream: TcpStream,
    engine: SharedEngine,
    mut outbound_rx: broadcast::Receiver<String>,
    clock: Clock,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut reader, mut writer) = stream.into_split();

    let writer_task = tokio::spawn(async move {
        loop {
            match outbound_rx.recv().await {
                Ok(line) => {
                    if writer.write_all(line.as_bytes()).await.is_err()
                        || writer.write_all(b"\n").await.is_err()
                    {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "host writer lagging, lines skipped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Line assembly happens in the engine; hand it raw bytes
    let mut buffer = [0u8; HOST_READ_BUFFER_SIZE];
    let result = loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                let mut engine = engine.lock().await;
                engine.feed_host(&buffer[..n], clock.now_ms());
            }
            Err(e) => break Err(e.into()),
        }
    };

    writer_task.abort();
    result
}
