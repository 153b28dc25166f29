//! Heritage Loader: batch migration of CSV heritage records into a repository API
//!
//! This crate turns spreadsheet rows describing cultural-heritage items into
//! item-creation requests against an Omeka-style REST API:
//!
//! 1. **Schema Pass** -- Read the live element listing to map field names
//!    ("Title", "Creator", ...) onto this installation's numeric element ids,
//!    falling back to a stock Dublin Core table when the listing is unavailable
//! 2. **Transform Pass** -- Convert each row into a payload: bilingual column
//!    fallback, HTML detection and escaping, tags, file URLs
//! 3. **Upload Pass** -- Send one request per row from a background task with
//!    rate limiting, cooperative cancellation, dry-run simulation and
//!    per-row success/failure accounting
//!
//! # Architecture
//!
//! - **Explicit configuration** -- An [`config::UploadConfig`] value is passed into
//!   every operation; there is no global session state
//! - **Event stream** -- Progress messages travel over an unbounded channel that
//!   the front end drains on its own schedule
//! - **Single-writer counters** -- Only the upload worker mutates the atomic
//!   counters; the foreground reads snapshots
//! - **Retry below the loop** -- Transient HTTP failures are retried by the
//!   transport; the upload loop never retries a row
//!
//! # Key Modules
//!
//! - [`client`] -- HTTP transport with bounded retry and exponential backoff
//! - [`schema`] -- Element id resolution with fallback policy
//! - [`transform`] -- Row to payload conversion (pure)
//! - [`upload`] -- Batch orchestration, single-row checks, background handle
//! - [`events`] -- Timestamped log events and their queue
//! - [`stats`] -- Atomic progress counters and run state
//! - [`ingest`] -- CSV reading with delimiter sniffing and header cleanup
//! - [`models`] -- Rows, field mappings and wire payload types
//! - [`config`] -- Constants and the upload configuration
//!
//! # Example Usage
//!
//! ```bash
//! # Check the key and list the element ids the server reports
//! heritage-loader probe --api-url https://example.org/api/
//! heritage-loader elements --api-url https://example.org/api/
//!
//! # Build every payload without sending anything
//! heritage-loader upload --csv items.csv --dry-run
//!
//! # Upload the first 50 rows, Spanish columns first, 250 ms apart
//! heritage-loader upload --csv items.csv --language spanish --limit 50 --delay-ms 250
//! ```

pub mod client;
pub mod config;
pub mod events;
pub mod ingest;
pub mod models;
pub mod schema;
pub mod stats;
pub mod transform;
pub mod upload;
