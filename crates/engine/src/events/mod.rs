mod bus;
mod objects;

pub use bus::{
    handler, DispatchReport, EventBus, EventBusError, Handler, HandlerError, HandlerResult,
    Notification, Subject, SubscriptionId, DEFAULT_LOCK_TIMEOUT,
};
pub use objects::{Liveness, ObjectId, ObjectRegistry};
