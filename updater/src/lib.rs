pub mod cleaner;
pub mod httpdownload;
pub mod orchestrator;
pub mod provider;
pub mod resolver;
pub mod scheduler;
pub mod settings;
pub mod util;
pub mod version;

pub use orchestrator::{
    CheckOutcome, Collaborators, DownloadOutcome, Installer, Orchestrator, Problem, SessionGuard,
    Snapshot,
};
pub use scheduler::{Notification, NotificationSink, SchedulingPermit};
pub use settings::{SettingManager, Settings};
pub use version::Version;
