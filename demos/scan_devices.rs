//! Basic example: Discover nearby Fluxmon flow meters
//!
//! Run with: cargo run --example scan_devices

use fluxmon_ble::{BleTransport, Result, Session, SessionEvent, SessionState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fluxmon_ble=debug".parse().unwrap()),
        )
        .init();

    println!("Starting Fluxmon meter discovery...");
    println!("Make sure the meter is powered and in range!\n");

    let transport = BleTransport::new().await?;
    let session = Session::new(transport);
    let mut events = session.subscribe_events();

    session.start_scan().await?;

    println!("Scanning (the scan stops on its own after the timeout)...");
    println!("Press Ctrl+C to exit early.\n");

    let mut reported = 0usize;
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::ScanResults(results)) => {
                        for advertisement in results.iter().skip(reported) {
                            println!("Discovered meter:");
                            println!("  Name: {}", advertisement.identity.name);
                            println!("  ID:   {}", advertisement.identity.id);
                            println!("  RSSI: {:?} dBm\n", advertisement.rssi);
                        }
                        reported = results.len();
                    }
                    Ok(SessionEvent::StateChanged(SessionState::Idle)) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted!");
                session.stop_scan().await;
                break;
            }
        }
    }

    println!("\n--- Scan Complete ---");
    let results = session.scan_results();
    println!("Total meters found: {}", results.len());
    for advertisement in &results {
        println!(
            "  {} - {} (RSSI: {:?})",
            advertisement.identity.name, advertisement.identity.id, advertisement.rssi
        );
    }

    session.shutdown().await;
    println!("\nDone!");

    Ok(())
}
