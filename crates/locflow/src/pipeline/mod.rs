pub mod count;
pub mod lister;
pub mod materialize;
pub mod notify;
pub mod workspace;

pub use count::{count_workspace, CountError};
pub use lister::{list_repos, ProviderError, RepoSummary};
pub use materialize::{materialize, MaterializeError};
pub use notify::{DeliveryError, Notifier};
pub use workspace::{cleanup, run_workspace};
