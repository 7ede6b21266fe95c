//! Proxsafe restore engine
//!
//! Takes a prepared bundle to a restored host:
//!
//! - **Categories**: the fixed catalog of restorable path groups
//! - **Planning**: mode, selection, export-only split, cluster SAFE/RECOVERY
//!   and PBS clean/merge behavior
//! - **Staged apply**: unpack into a staging root, take a safety backup, then
//!   apply each category with its own handler (API first where one exists)
//! - **Services**: stop, start and wait for Proxmox units around the apply
//! - **Network safety**: deadman rollback, NIC renaming and fstab merge
//!
//! # Examples
//!
//! ```no_run
//! use proxsafe_core::{Deps, RestoreConfig};
//! use proxsafe_restore::RestoreSession;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let deps = Deps::system(RestoreConfig::load(None)?);
//!     let report = RestoreSession::new(&deps, proxsafe_restore::VERSION)
//!         .run(&CancellationToken::new())
//!         .await?;
//!     println!("{} categories processed", report.categories.len());
//!     Ok(())
//! }
//! ```

pub mod apply;
pub mod categories;
pub mod cluster;
pub mod error;
pub mod export;
pub mod network;
pub mod plan;
pub mod prompter;
pub mod section_config;
pub mod services;
pub mod session;
pub mod system;

// Re-export commonly used types
pub use apply::{apply_plan, ApplyResult, CategoryReport, Outcome};
pub use categories::{Category, CategoryType, CATALOG};
pub use error::{Error, NotCommitted, Result};
pub use export::{export_categories, ExportResult};
pub use plan::{PbsBehavior, RestoreMode, RestorePlan};
pub use prompter::{RestorePrompter, UiPrompter};
pub use services::Services;
pub use session::{RestoreReport, RestoreSession};
pub use system::{detect_system, FixedSystem, FsDetector, SystemDetector};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
