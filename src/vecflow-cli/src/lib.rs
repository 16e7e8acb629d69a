//! vecflow - pipelines and hybrid search over persisted entities
//!
//! This crate provides both a library and the `vecflow` binary.
//!
//! # Embedded Usage
//!
//! ```rust,no_run
//! use vecflow_cli::app::App;
//! use vecflow_core::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app = App::open(Config::default(), None, None).await?;
//!     app.ingest(&["smart".to_string()]).await?;
//!     for chunk in app.search("smart people", 3).await? {
//!         println!("{}", chunk.text("text")?);
//!     }
//!     Ok(())
//! }
//! ```

pub use vecflow_core;

pub mod app;
pub mod cli;
pub mod telemetry;
