//! link simulation for packet-bbs

use std::time::Duration;

use anyhow::Result;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use packet_bbs_sim::{scenarios, Conditions, SimulationPresets};

const BULLETINS: usize = 10;
const BULLETIN_SIZE: usize = 300;
const BEACONS: usize = 20;

// simulated clock: hours of retries finish in moments
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();
    tokio::time::pause();

    println!("{}", "packet-bbs Link Simulation".bright_blue().bold());
    println!("{}", "==========================".bright_blue());
    println!();

    let test_scenarios = vec![
        ("Good Conditions", SimulationPresets::good_conditions()),
        ("Average Conditions", SimulationPresets::average_conditions()),
        ("Poor Conditions", SimulationPresets::poor_conditions()),
    ];

    for (name, conditions) in test_scenarios {
        println!("{}", format!("\n>>> Testing: {}", name).bright_green().bold());
        describe(&conditions);
        run(&conditions).await?;
        println!("{}", "Test complete!".bright_yellow());
        println!("{}", "-".repeat(50));
    }

    println!("{}", "\n>>> Testing: Extreme Conditions (deep fade)".bright_red().bold());
    let extreme = SimulationPresets::extreme_conditions();
    describe(&extreme);
    println!("\nNote: half of all frames are lost on the air");
    run(&extreme).await?;

    println!("\n{}", "All simulations complete!".bright_green().bold());
    Ok(())
}

fn describe(conditions: &Conditions) {
    println!("Packet Loss: {}%", (conditions.ether.packet_loss * 100.0) as u32);
    println!("Latency: {:?}", conditions.ether.latency);
    println!(
        "Frame: {} bytes, window {}, {} frames per turn, retry every {:?} up to {} times",
        conditions.link.frame_size_max,
        conditions.link.window_size,
        conditions.link.frames_per_turn,
        conditions.link.delivery_retry_time,
        conditions.link.max_delivery_attempts,
    );
    println!();
}

async fn run(conditions: &Conditions) -> Result<()> {
    println!("=== Mailbox transfer: {} x {} bytes ===", BULLETINS, BULLETIN_SIZE);
    let spinner = spinner("transferring bulletins");
    let transfer =
        scenarios::mailbox_transfer(conditions, BULLETINS, BULLETIN_SIZE, Duration::from_secs(6 * 3600)).await;
    spinner.finish_and_clear();
    match transfer {
        Ok(report) => {
            let verdict = if report.completed() {
                "✓ all bulletins delivered in order".green()
            } else {
                format!("✗ {} of {} delivered", report.delivered, report.sent).red()
            };
            println!("{}", verdict);
            println!("  Simulated time: {:?}", report.elapsed);
            println!("  Goodput: ~{:.0} bps", report.goodput_bps());
            println!(
                "  Air: {} writes, {} lost, {} heard",
                report.ether.writes, report.ether.dropped, report.ether.delivered
            );
            println!(
                "  Client queue: {} frames in {} turns, {} write failures",
                report.client_queue.transmitted, report.client_queue.turns, report.client_queue.write_failures
            );
            println!(
                "  BBS queue: {} frames in {} turns",
                report.server_queue.transmitted, report.server_queue.turns
            );
            if let Some(reason) = report.closed {
                println!("  Session closed: {}", reason);
            }
        }
        Err(e) => println!("{}", format!("✗ transfer failed: {:#}", e).red()),
    }

    println!("\n=== Beacon burst: {} UI frames ===", BEACONS);
    let spinner = self::spinner("sending beacons");
    let report = scenarios::beacon_burst(conditions, BEACONS).await;
    spinner.finish_and_clear();
    let report = report?;
    println!(
        "  Heard {} of {} ({}% loss)",
        report.heard,
        report.sent,
        report.sent.saturating_sub(report.heard) * 100 / report.sent.max(1)
    );
    Ok(())
}

fn spinner(message: &'static str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
        bar.set_style(style);
    }
    bar.set_message(message);
    // wall clock ticks, the simulation itself runs on paused time
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}
