//! Listener configuration: static declarations, per-subject overrides and
//! the resolved configuration each listener runs with.

mod declaration;
mod effective;
mod overrides;

pub use declaration::{
    //
    ListenerDeclaration,
    ListenerDeclarationBuilder,
    PoolSettings,
    PullSettings,
    SaturationPolicy,
    DEFAULT_BLOCKING_QUEUE_SIZE,
    DEFAULT_CONSUME_THREAD_MAX,
    DEFAULT_CONSUME_THREAD_NUMBER,
    DEFAULT_KEEP_ALIVE,
    DEFAULT_MAX_DELIVER,
    DEFAULT_MAX_WAIT,
    DEFAULT_PULL_BATCH_SIZE,
    DEFAULT_PULL_DELAY,
    DEFAULT_PULL_INTERVAL,
};

pub use effective::{EffectiveConfig, SubscriptionMode};
pub use overrides::{SubjectOverride, SubjectOverrides};
