//! Real-time flow monitoring example
//!
//! Run with: cargo run --example watch_meter

use fluxmon_ble::{
    format_reading, liters_to_gallons, lpm_to_lph, BleTransport, Error, Result, Session,
    SessionEvent, SessionState, TelemetrySnapshot,
};
use std::io::Write;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (minimal)
    tracing_subscriber::fmt().with_env_filter("warn").init();

    println!("Flow Monitor");
    println!("============\n");
    println!("Looking for meters...\n");

    let transport = BleTransport::new().await?;
    let session = Session::new(transport);

    session.start_scan().await?;

    // Give the radio a few seconds to hear an advertisement
    tokio::time::sleep(Duration::from_secs(5)).await;

    let meter = session
        .scan_results()
        .into_iter()
        .max_by_key(|advertisement| advertisement.rssi.unwrap_or(i16::MIN))
        .ok_or_else(|| Error::PeripheralNotFound {
            identifier: "any".to_string(),
        })?;

    println!("Found meter: {} ({})", meter.identity.name, meter.identity.id);
    println!("Connecting...\n");

    let mut events = session.subscribe_events();
    let mut snapshots = session.subscribe_snapshots();
    session.connect(&meter.identity).await?;

    println!("Connected! Monitoring flow...");
    println!("Press Ctrl+C to exit.\n");

    // Monitor loop
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n\nExiting...");
                break;
            }
            snapshot = snapshots.recv() => {
                match snapshot {
                    Ok(snapshot) => display_snapshot(&session, &snapshot),
                    Err(_) => break,
                }
            }
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::Alert(error)) => {
                        eprintln!("\nAlert: {}", error);
                    }
                    Ok(SessionEvent::StateChanged(SessionState::Idle)) => {
                        println!("\nLink closed.");
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    session.disconnect().await;
    session.shutdown().await;

    Ok(())
}

fn display_snapshot(session: &Session<BleTransport>, snapshot: &TelemetrySnapshot) {
    // Clear screen and move cursor to top
    print!("\x1B[2J\x1B[1;1H");

    println!("=== Flow Monitor ===");
    println!("Serial: {}", snapshot.serial_number);
    println!("Lot: {}  Expiry: {}", snapshot.lot_code, snapshot.expiry);
    println!("Session: {:?} (generation {})\n", session.state(), snapshot.generation);

    println!("Bank A:");
    println!("-------");
    println!(
        "  Volume: {} L ({} gal)",
        format_reading(snapshot.liters_a),
        format_reading(liters_to_gallons(snapshot.liters_a.into()) as f32)
    );
    println!(
        "  Flow:   {} L/min ({} L/h)",
        format_reading(snapshot.flow_a),
        format_reading(lpm_to_lph(snapshot.flow_a.into()) as f32)
    );

    println!("\nBank B:");
    println!("-------");
    println!(
        "  Volume: {} L ({} gal)",
        format_reading(snapshot.liters_b),
        format_reading(liters_to_gallons(snapshot.liters_b.into()) as f32)
    );
    println!(
        "  Flow:   {} L/min ({} L/h)",
        format_reading(snapshot.flow_b),
        format_reading(lpm_to_lph(snapshot.flow_b.into()) as f32)
    );

    println!("\nSupply: {} V", format_reading(snapshot.supply_voltage));
    println!("Updated: {}", snapshot.captured_at.format("%H:%M:%S%.3f"));

    println!("\nPress Ctrl+C to exit");
    let _ = std::io::stdout().flush();
}
