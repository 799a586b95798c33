//! A pure Rust client for Universal Powerline Bus (UPB) Powerline
//! Interface Modules over TCP.
//!
//! The aim of this crate is to provide a rustic, no non-sense API for
//! talking to a PIM, whether it is exposed directly through a
//! serial-to-ethernet bridge (raw ASCII, CR delimited) or sits behind an
//! authenticated PulseWorx gateway (length prefixed frames, HMAC-MD5
//! login).
//!
//! The client drives the PIM in message mode, reassembling bus packets
//! from the per-pulse telemetry, serializes commands with timeout and
//! resend, keeps a mirror of each device's 256 byte register memory, and
//! can recover a device's setup password from the checksum arithmetic of
//! its signature report.
//!
//! # Usage
//!
//! Add a dependency to `upb-pim` to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! upb-pim = "0.1"
//! ```
//!
//! # Examples
//!
//! ## Dump a device's register memory
//!
//! ```rust,no_run
//! use upb_pim::{ClientConfig, UpbClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), upb_pim::Error> {
//!     let client = UpbClient::connect(ClientConfig::new("192.168.1.30")).await?;
//!     let registers = client.read_device_registers(5, 3).await?;
//!     println!("network {} unit {}", registers[0], registers[1]);
//!     client.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Switch a load through a gateway
//!
//! ```rust,no_run
//! use upb_pim::packet::DeviceControlCmd;
//! use upb_pim::{ClientConfig, UpbClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), upb_pim::Error> {
//!     let mut config = ClientConfig::new("gateway.local");
//!     config.username = Some("installer".into());
//!     config.password = Some("secret".into());
//!     let client = UpbClient::connect(config).await?;
//!     // 100% on, immediate.
//!     client
//!         .device_control(5, 3, DeviceControlCmd::Goto, &[100, 0], false)
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod device;
pub mod error;
pub mod packet;
pub mod pim;

mod gateway;
mod pulse;
mod transport;

pub use crate::client::{ClientConfig, PimInfo, UpbClient, DEFAULT_PORT};
pub use crate::device::DeviceMemory;
pub use crate::error::Error;
pub use crate::packet::{Mdid, TransmitOptions, UpbPacket};
