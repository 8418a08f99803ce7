mod bus;
mod driver;

use bus::MemoryBus;
use clap::Parser;
use driver::{now_ms, PeerDriver};
use engine::{share, JoinIntent, MemoryStore, RaceEngine, ShareCode};
use log::info;
use protocol::RacePhase;
use rand::Rng;
use std::time::Duration;
use tokio::time::interval;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of simulated racers joining the host
    #[arg(short = 'b', long, default_value = "3")]
    bots: usize,

    /// Room identifier
    #[arg(short = 'r', long, default_value = "demo-room")]
    room: String,

    /// Lobby display name
    #[arg(long, default_value = "Demo Lobby")]
    room_name: String,
}

/// Advances a simulated racer by a random chunk, finishing at 100%.
fn advance_racer(engine: &mut RaceEngine, now: u64) {
    let Some(me) = engine.self_member().cloned() else {
        return;
    };
    if me.is_spectator || me.finished {
        return;
    }
    let mut rng = rand::thread_rng();
    let progress = (me.progress + rng.gen_range(8.0..20.0)).min(100.0);
    let wpm = rng.gen_range(55.0..105.0);
    let accuracy = rng.gen_range(92.0..100.0);

    if progress >= 100.0 {
        let elapsed = engine
            .race_start_ms()
            .map(|s| now.saturating_sub(s) as f64 / 1000.0)
            .unwrap_or_default();
        let _ = engine.report_finish(wpm, accuracy, elapsed, vec![wpm], String::new(), now);
    } else {
        let _ = engine.report_progress(progress, wpm, accuracy, (progress * 3.0) as u32, now);
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let bus = MemoryBus::new();
    let now = now_ms();

    info!("Creating room {} with {} bots", args.room, args.bots);
    let host_engine = RaceEngine::create(
        &args.room,
        &args.room_name,
        "host",
        Box::new(MemoryStore::new()),
    );
    let join_key = host_engine
        .join_key()
        .map(str::to_string)
        .unwrap_or_default();
    let mut host = PeerDriver::new(host_engine, &bus);
    host.connect(now);

    let mut bots: Vec<PeerDriver> = (0..args.bots)
        .map(|i| {
            let intent = JoinIntent::racer(&args.room, format!("bot-{i}"), join_key.clone());
            let engine = RaceEngine::join(intent, Box::new(MemoryStore::new()));
            let mut driver = PeerDriver::new(engine, &bus);
            driver.connect(now_ms());
            driver
        })
        .collect();

    let mut pump_interval = interval(Duration::from_millis(50));
    let mut action_interval = interval(Duration::from_millis(400));
    let mut start_requested = false;

    loop {
        tokio::select! {
            _ = pump_interval.tick() => {
                let now = now_ms();
                host.pump(now);
                for bot in bots.iter_mut() {
                    bot.pump(now);
                }
                if host.engine().phase() == RacePhase::Finished
                    && bots.iter().all(|b| b.engine().phase() == RacePhase::Finished)
                {
                    break;
                }
            },

            _ = action_interval.tick() => {
                let now = now_ms();
                match host.engine().phase() {
                    RacePhase::Waiting => {
                        if !host.engine().self_member().map(|m| m.ready).unwrap_or(false) {
                            let _ = host.engine_mut().set_ready(true, now);
                        }
                        for bot in bots.iter_mut() {
                            if !bot.engine().self_member().map(|m| m.ready).unwrap_or(false) {
                                let _ = bot.engine_mut().set_ready(true, now);
                            }
                        }
                        if !start_requested && host.engine_mut().start_race(now).is_ok() {
                            info!("All racers ready, countdown running");
                            start_requested = true;
                        }
                    },
                    RacePhase::Racing => {
                        advance_racer(host.engine_mut(), now);
                        for bot in bots.iter_mut() {
                            advance_racer(bot.engine_mut(), now);
                        }
                    },
                    _ => {},
                }
            },
        }
    }

    for result in host.engine().results() {
        info!(
            "#{} {} at {:.1} wpm ({:.1}% accuracy, {:.1}s)",
            result.position, result.name, result.wpm, result.accuracy, result.time
        );
    }
    if let Some(summary) = host.engine().summary() {
        info!(
            "Field: mean {:.1} wpm, spread {:.1} wpm",
            summary.mean_wpm, summary.wpm_spread
        );
    }

    let code = ShareCode {
        paragraph_index: host.engine().paragraph_index(),
        round: host.engine().round(),
        results: host.engine().results().to_vec(),
    };
    println!("share code: {}", share::encode(&code));
}
