//! Dump a UPB device's 256 byte register memory, recovering the device
//! password when one is set.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use upb_pim::{ClientConfig, UpbClient};

#[derive(Parser)]
#[command(about = "Dump a UPB device's register memory")]
struct Args {
    /// PIM or gateway host.
    #[arg(long)]
    host: String,
    /// TCP port.
    #[arg(long, default_value_t = upb_pim::DEFAULT_PORT)]
    port: u16,
    /// UPB network id of the device.
    #[arg(long)]
    network: u8,
    /// Unit id of the device.
    #[arg(long)]
    device: u8,
    /// Gateway account name; enables the authenticated gateway dialect.
    #[arg(long)]
    user: Option<String>,
    /// Gateway account password.
    #[arg(long)]
    pass: Option<String>,
    /// Log protocol traffic.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = if args.verbose {
        EnvFilter::new("upb_pim=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ClientConfig::new(args.host);
    config.port = args.port;
    config.username = args.user;
    config.password = args.pass;

    let client = UpbClient::connect(config).await?;
    let registers = client
        .read_device_registers(args.network, args.device)
        .await?;
    client.stop();

    for (row, chunk) in registers.chunks(16).enumerate() {
        let line = chunk
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<Vec<_>>()
            .join(":");
        println!("{:02x}0: {}", row, line);
    }
    Ok(())
}
