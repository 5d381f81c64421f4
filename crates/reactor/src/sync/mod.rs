pub mod channel;
pub mod mailbox;
pub mod manager;
pub mod utils;

pub use channel::{PollOutcome, SyncChannel};
pub use mailbox::{Mailbox, MailboxItem};
pub use manager::{ChannelError, Remote, SyncManager};
pub use utils::{DocumentBatch, batch_operations_by_document, filter_operations};
