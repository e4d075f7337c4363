//! Message handler trait and closure adapters.
//!
//! A listener is the application's handler for one durable consumer. It
//! declares the payload type it wants through [`Listener::Message`]; the
//! dispatcher converts every message body into that type before the
//! handler is called.

use std::future::Future;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use crate::{HandlerError, PayloadType};

/// Application message handler.
///
/// Returning `Err` (or panicking) makes the dispatcher negatively
/// acknowledge the message so the broker redelivers it, bounded by the
/// listener's `max_deliver`. Returning `Ok` acknowledges it when
/// `auto_ack` is enabled.
///
/// # Example
///
/// ```
/// use mom_listener::{HandlerError, Listener};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct OrderCreated {
///     id: u64,
/// }
///
/// struct Audit;
///
/// #[mom_listener::async_trait]
/// impl Listener for Audit {
///     type Message = OrderCreated;
///
///     async fn on_message(&self, order: OrderCreated) -> Result<(), HandlerError> {
///         println!("order {}", order.id);
///         Ok(())
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait Listener: Send + Sync + 'static {
    // ---
    /// Payload handed to [`on_message`](Self::on_message).
    type Message: DeserializeOwned + Send + 'static;

    /// How the payload is produced from the message body.
    ///
    /// Text listeners receive the body verbatim and must use a payload
    /// type that accepts a plain string. A `String` payload is always
    /// delivered as text.
    const PAYLOAD: PayloadType = PayloadType::Structured;

    /// Handle one decoded message.
    async fn on_message(&self, message: Self::Message) -> Result<(), HandlerError>;
}

/// [`Listener`] backed by an async closure over a structured payload.
///
/// Built with [`listener_fn`].
pub struct FnListener<F, T> {
    func: F,
    _phantom: PhantomData<fn(T)>,
}

/// Wrap an async closure as a structured-payload listener.
pub fn listener_fn<F, Fut, T>(func: F) -> FnListener<F, T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    T: DeserializeOwned + Send + 'static,
{
    FnListener {
        func,
        _phantom: PhantomData,
    }
}

#[async_trait::async_trait]
impl<F, Fut, T> Listener for FnListener<F, T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    T: DeserializeOwned + Send + 'static,
{
    type Message = T;

    async fn on_message(&self, message: T) -> Result<(), HandlerError> {
        (self.func)(message).await
    }
}

/// [`Listener`] backed by an async closure over the raw body text.
///
/// Built with [`text_listener_fn`].
pub struct TextFnListener<F> {
    func: F,
}

/// Wrap an async closure as a text listener.
pub fn text_listener_fn<F, Fut>(func: F) -> TextFnListener<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    TextFnListener { func }
}

#[async_trait::async_trait]
impl<F, Fut> Listener for TextFnListener<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    type Message = String;
    const PAYLOAD: PayloadType = PayloadType::Text;

    async fn on_message(&self, message: String) -> Result<(), HandlerError> {
        (self.func)(message).await
    }
}
