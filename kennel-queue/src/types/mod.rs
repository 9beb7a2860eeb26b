pub mod ids;
pub mod options;
pub mod record;
pub mod events;

pub use ids::{JobId, LeaseToken, WorkerId};
pub use options::EnqueueOptions;
pub use record::{Job, JobState};
pub use events::JobEvent;
