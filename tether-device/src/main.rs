use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tether_device::{Device, DeviceConfig, DeviceEvent};
use tether_proto::{Channel, DeviceType};

#[derive(Debug, Parser)]
#[command(about = "Tether device: register with a relay and exchange status/commands")]
struct Opts {
    /// Relay host for udp and tcp.
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    udp: bool,

    #[arg(long)]
    tcp: bool,

    /// WebSocket url, e.g. ws://localhost:33331/ws
    #[arg(long)]
    ws: Option<String>,

    #[arg(long)]
    channel: Option<String>,

    /// toy, controller or observer
    #[arg(long = "type")]
    device_type: Option<DeviceType>,

    /// Keepalive ping interval in milliseconds; 0 disables it.
    #[arg(long)]
    keepalive_ms: Option<u64>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Register and print every event until interrupted.
    Watch,
    /// Register, send one status (toy) or command (controller), and exit.
    Send {
        /// JSON payload; anything that is not valid JSON is sent as a string.
        data: String,
        #[arg(long)]
        sticky: bool,
    },
}

impl Opts {
    fn config(&self) -> anyhow::Result<DeviceConfig> {
        let mut config = DeviceConfig::from_env()?;
        if let Some(host) = &self.host {
            config.relay_host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.udp || self.tcp || self.ws.is_some() {
            config.udp = self.udp;
            config.tcp = self.tcp;
            config.ws_url = self.ws.clone();
        }
        if let Some(channel) = &self.channel {
            config.channel = Channel::from(channel.as_str());
        }
        if let Some(device_type) = self.device_type {
            config.device_type = device_type;
        }
        if let Some(ms) = self.keepalive_ms {
            config.keepalive_ms = ms;
        }
        Ok(config)
    }
}

fn print_event(event: &DeviceEvent) {
    match event {
        DeviceEvent::Registered { uid, channel } => {
            eprintln!("registered uid={uid} channel={channel}")
        }
        DeviceEvent::Status { seq, data } => println!("status seq={seq} {data}"),
        DeviceEvent::Command { seq, data } => println!("command seq={seq} {data}"),
        DeviceEvent::Error { seq, code } => {
            eprintln!("error seq={seq} {} ({})", code.code(), code.message())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opts = Opts::parse();
    let config = opts.config()?;
    let device_type = config.device_type;

    let mut device = Device::connect(config).await.context("connect to relay")?;
    device.wait_registered().await?;

    match opts.cmd {
        Cmd::Watch => loop {
            tokio::select! {
                event = device.next_event() => match event {
                    Some(event) => print_event(&event),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        },
        Cmd::Send { data, sticky } => {
            let data = serde_json::from_str(&data).unwrap_or(Value::String(data));
            let seq = match (device_type, sticky) {
                (DeviceType::Toy, false) => device.status(data).await?,
                (DeviceType::Toy, true) => device.sticky_status(data).await?,
                (DeviceType::Controller, false) => device.command(data).await?,
                (DeviceType::Controller, true) => device.sticky_command(data).await?,
                (DeviceType::Observer, _) => bail!("observers cannot send"),
            };
            eprintln!("sent seq={seq}");
        }
    }

    device.close().await;
    Ok(())
}
