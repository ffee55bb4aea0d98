//! Job execution for stash-ingest.
//!
//! # Overview
//!
//! Long-running work (scans, checksum generation) runs as jobs under a
//! [`JobManager`]. Each job moves through
//! `Queued -> Running -> {Completed | Failed | Cancelled}` and carries a
//! cancellation token plus a [`JobProgress`] handle. Jobs that fan out
//! per-file work use a [`TaskQueue`]: a bounded backlog drained by a fixed
//! number of workers, so submission waits when the backlog is full.
//! [`JobManager::start`] runs a job at once, outside the concurrency limit,
//! and [`JobManager::subscribe_events`] streams [`JobEvent`]s as jobs are
//! added, progress, and finish.
//!
//! Checksum tasks hold a [`ReadLock`] from the [`ReadLockManager`] shared
//! with the scanner, which cancels and waits for them before it moves a file
//! or records new content for it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use si_core::{JobConfig, LibraryConfig, ScanConfig};
//! use si_jobs::{JobManager, ScanJob};
//! use si_scanner::fs::OsFs;
//! use si_scanner::repository::MemoryRepository;
//! use si_scanner::{ScanOptions, Scanner};
//!
//! # async fn example() -> Result<(), si_jobs::JobError> {
//! let scanner = Scanner::new(Arc::new(OsFs), Arc::new(MemoryRepository::new()), ScanConfig::default())
//!     .with_libraries(vec![LibraryConfig::new("/media/library")]);
//!
//! let manager = JobManager::new(JobConfig::default());
//! let job = ScanJob::new(scanner, ScanOptions::default());
//! let id = manager.add(job.description(), |ctx| job.run(ctx));
//!
//! let info = manager.wait(id).await?;
//! println!("{}: {}", info.description, info.status);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

mod error;
mod hash;
mod job;
mod manager;
mod progress;
mod queue;
mod scan;

pub use error::JobError;
pub use hash::HashJob;
pub use job::{JobContext, JobEvent, JobId, JobInfo, JobStatus};
pub use manager::JobManager;
pub use progress::{JobProgress, TaskLabel};
pub use queue::TaskQueue;
pub use scan::ScanJob;
pub use si_scanner::lock::{ReadLock, ReadLockManager};
