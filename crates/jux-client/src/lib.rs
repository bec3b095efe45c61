//! Publisher client for signed JUnit reports.
//!
//! Submits signed report bytes to a Jux server (`POST {url}/junit/submit`),
//! classifies the answer and retries transient failures with exponential
//! backoff.
//!
//! # Quick Start
//!
//! ```no_run
//! use jux_client::{PublisherClient, PublisherConfig, SystemClock};
//!
//! # fn example(signed: &[u8]) -> anyhow::Result<()> {
//! let client = PublisherClient::new(
//!     PublisherConfig::default().with_url("https://jux.example.com/api/v1"),
//! )?;
//! let result = client.submit(signed, &SystemClock)?;
//! println!("test run {}", result.run_id);
//! # Ok(())
//! # }
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `JUX_API_URL` | API base URL | `http://localhost:4000/api/v1` |
//! | `JUX_API_TOKEN` | Bearer token | None |
//! | `JUX_API_TIMEOUT` | Request timeout (seconds) | 30 |
//! | `JUX_API_MAX_RETRIES` | Retries for transient failures | 3 |

pub mod auth;
pub mod client;
pub mod clock;
pub mod error;
pub mod types;

pub use auth::TokenProvider;
pub use client::{
    HttpTransport, PublisherClient, CLIENT_USER_AGENT, SubmitRequest, Transport, TransportResponse,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ClientResult, PublishError};
pub use types::{PublishResult, PublisherConfig, RunSummary};
