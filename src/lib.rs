//! # Binlink - binary transfers over delimiter-framed device links
//!
//! Binlink moves arbitrary binary payloads (firmware images, uploaded files)
//! from a host to a small peripheral over a serial or I2C link whose packets
//! are terminated by a reserved byte, and optionally on through the device to
//! a cloud relay.
//!
//! ## Features
//!
//! - **COBS Stuffing**: Byte stuffing with a delimiter XOR, so encoded chunks never contain the link terminator.
//! - **Chunked Transfers**: Capacity negotiation, per-chunk MD5 verification, commit polling and unbounded retry of transient link errors.
//! - **Binpack Containers**: Multi-file firmware packages compressed frame by frame, with per-file MD5 catalog.
//! - **Async Design**: Built on Tokio; the device connection is any type implementing [`transfer::Link`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use binlink::config::Config;
//! use binlink::transfer::{Destination, Link, TransferEngine};
//!
//! async fn upload<L: Link>(link: &mut L, image: &[u8]) -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let report = TransferEngine::new(link, config.transfer)
//!         .run(image, &Destination::Relay("firmware".to_string()))
//!         .await?;
//!     println!("{} bytes in {} chunks", report.bytes, report.chunks);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`cobs`] - COBS encode/decode with delimiter XOR
//! - [`binpack`] - Frame-compressed multi-file containers
//! - [`transfer`] - Chunked reliable transfer engine and the device link contract
//! - [`config`] - TOML configuration
//! - [`logutil`] - Log formatting helpers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Binpack      │ ← optional: files → compressed container
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │    Transfer     │ ← negotiate, stage, verify, commit per chunk
//! │    Engine       │
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │    COBS +       │ ← chunk bytes on the wire
//! │    Link         │
//! └─────────────────┘
//! ```

pub mod binpack;
pub mod cobs;
pub mod config;
pub mod logutil;
pub mod transfer;
