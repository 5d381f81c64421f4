pub mod config;
pub mod events;
pub mod executor;
pub mod index;
pub mod proto;
pub mod queue;
pub mod reactor;
pub mod sync;
pub mod transport;
pub mod types;
pub mod writer;

pub use config::{Config, ExecutorConfig, ServerConfig, StorageConfig, SyncConfig};
pub use events::{Event, EventBus, EventKind, FailureKind, SubscriptionId};
pub use executor::{ExecutorStats, ExecutorStatus, JobError, JobExecutor, JobHandler};
pub use index::{IndexError, IndexTransaction, OperationIndex, SqliteIndex};
pub use queue::JobQueue;
pub use reactor::{JobStatus, Reactor, ReactorError};
pub use sync::{ChannelError, SyncChannel, SyncManager};
pub use transport::{SyncClient, SyncListener, SyncService, TransportError};
pub use types::{
    Action, DeadLetter, DeadLetterCategory, DeadLetterLog, IndexEntry, Job, JobResult, Operation,
    PagedResult, Paging, RemoteFilter, SyncEnvelope, SyncOperation, ViewFilter,
};
pub use writer::{
    CollectionRegistry, CollectionSpec, NoopReducer, OperationReducer, OperationWriter,
    ReducerError,
};
