mod push;
mod scheduled;
mod sync;
mod triage;

pub use push::PushJobHandler;
pub use scheduled::{CleanupHandler, SyncAllHandler};
pub use sync::SyncJobHandler;
pub use triage::{TriageJobHandler, TriageService};
