mod atomic_io;
mod sink;
mod store;
mod worker;
mod world;

pub use sink::{ChatChannel, MessageSink, RecordingSink, SentMessage, SinkError, TracingSink};
pub use store::{JsonFileStore, MemoryStore, Persistence, Record, StoreError};
pub use worker::{LoadReply, StoreQueue, StoreWorker, WorkerError};
pub use world::{ActorKind, ActorSnapshot, Vec2, WorldQuery};
