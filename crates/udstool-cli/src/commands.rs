//! Subcommand implementations

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use udstool_isotp::{
    ChannelEvent, IsoTpChannel, MockCanBus, SimulatedEcu, UdsResponse,
};

use crate::config::Config;

/// Parse a request given as hex, spaces allowed (`"22 F1 90"`, `"22F190"`)
pub fn parse_request(text: &str) -> Result<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let payload =
        hex::decode(&compact).with_context(|| format!("Invalid request hex: '{}'", text))?;
    if payload.is_empty() {
        bail!("Empty request");
    }
    Ok(payload)
}

fn spaced_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Send each request to the simulated ECU and print what came back
pub async fn send(config: &Config, requests: &[String], trace: bool) -> Result<()> {
    let payloads = requests
        .iter()
        .map(|r| parse_request(r))
        .collect::<Result<Vec<_>>>()?;

    let bus = Arc::new(MockCanBus::new());
    let ecu = SimulatedEcu::from_config(config.isotp.clone(), &config.ecu)
        .context("Invalid [ecu] configuration")?;
    let ecu_task = Arc::new(ecu).attach(&bus);
    let channel = IsoTpChannel::new(bus, config.isotp.clone())
        .context("Failed to open ISO-TP channel")?;
    let mut events = channel.subscribe();

    let mut failures = 0;
    for payload in &payloads {
        println!("-> {}", spaced_hex(payload));
        let result = channel.send_request(payload).await;

        while let Ok(event) = events.try_recv() {
            if let ChannelEvent::Trace(line) = event {
                if trace {
                    println!("   {}", line);
                }
            }
        }

        match result {
            Ok(response) => {
                println!("<- {}", spaced_hex(&response));
                match UdsResponse::parse(&response) {
                    Ok(uds) => println!("   {}", uds),
                    Err(e) => println!("   {}", e),
                }
            }
            Err(e) => {
                failures += 1;
                println!("!! {}", e);
            }
        }
    }

    channel.shutdown();
    ecu_task.abort();

    if failures > 0 {
        bail!("{} of {} requests failed", failures, payloads.len());
    }
    Ok(())
}

/// Print the effective configuration as TOML
pub fn show_config(config: &Config) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    print!("{}", rendered);
    Ok(())
}
