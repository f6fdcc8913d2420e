//! rmidid - RTP-MIDI diagnostic endpoint
//!
//! Connects to a remote AppleMIDI session and logs everything the session
//! produces: the handshake outcome, clock-sync round trips and decoded
//! MIDI events. Useful for checking that a remote endpoint speaks the
//! protocol before wiring it into anything bigger.

use std::cell::Cell;
use std::rc::Rc;

use rmidid_client::{ClientConfig, Endpoint, RtpClient};
use rmidid_reactor::Poller;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(hostname) = args.next() else {
        eprintln!("usage: rmidid <hostname> [port] [name]");
        std::process::exit(2);
    };
    let port = args.next().unwrap_or_default();
    let name = args.next().unwrap_or_else(|| "rmidid".to_string());

    tracing::info!("Starting rmidid endpoint");
    tracing::info!("  Remote: [{hostname}]:{port}");
    tracing::info!("  Local name: {name}");

    let poller = Poller::new();
    let client = RtpClient::new(&poller, ClientConfig::new(name))?;
    tracing::info!(
        "  Local ports: {}/{}",
        client.local_base_port().unwrap_or_default(),
        client.local_base_port().unwrap_or_default() + 1
    );

    let _connected = client.connected_signal().connect(|name: &String| {
        tracing::info!("Session established with \"{name}\"");
    });
    let _midi = client.decoded_midi_signal().connect(|events: &Vec<_>| {
        for event in events {
            tracing::info!("midi: {event:?}");
        }
    });
    let _ck = client.ck_signal().connect(|rtt: &f64| {
        tracing::debug!("clock sync round trip: {rtt:.1} ms");
    });

    let done = Rc::new(Cell::new(None));
    let _disconnected = {
        let done = done.clone();
        client
            .disconnected_signal()
            .connect(move |reason| done.set(Some(*reason)))
    };

    client.connect_to(vec![Endpoint::new(hostname, port)])?;

    while done.get().is_none() {
        poller.run_once()?;
    }

    tracing::info!("Session over: {:?}", done.get().unwrap());
    Ok(())
}
