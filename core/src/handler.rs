//! Handler registration interface.
//!
//! The business layer decides success or failure; the consumer runtime decides
//! acknowledge or dead-letter. Handlers receive a decoded [`Event`] and never
//! see the broker delivery.

use crate::delivery::BoxFuture;
use crate::error::HandlerError;
use crate::event::Event;
use std::future::Future;
use std::sync::Arc;

/// Invoked once per delivered event.
pub trait EventHandler: Send + Sync {
    /// Process one event. `Ok` acknowledges, `Err` dead-letters.
    ///
    /// # Errors
    ///
    /// Any [`HandlerError`] dead-letters the message.
    fn handle(&self, event: Event) -> BoxFuture<'_, Result<(), HandlerError>>;
}

impl<H: EventHandler + ?Sized> EventHandler for Arc<H> {
    fn handle(&self, event: Event) -> BoxFuture<'_, Result<(), HandlerError>> {
        (**self).handle(event)
    }
}

/// Adapter turning an async closure into an [`EventHandler`].
///
/// # Example
///
/// ```
/// use event_relay_core::handler::{handler_fn, EventHandler};
///
/// let handler = handler_fn(|event| async move {
///     println!("got {}", event.event_id);
///     Ok(())
/// });
/// # fn assert_handler(_: &impl EventHandler) {}
/// # assert_handler(&handler);
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

/// See [`handler_fn`].
#[derive(Clone)]
pub struct HandlerFn<F>(F);

impl<F, Fut> EventHandler for HandlerFn<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, event: Event) -> BoxFuture<'_, Result<(), HandlerError>> {
        Box::pin((self.0)(event))
    }
}

/// Service-specific business effect of a newly seen event.
///
/// Implementations that share storage with the idempotency store should commit
/// the effect and the event id together, so a crash cannot leave an applied
/// effect without its record.
pub trait SideEffect: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Apply the effect for `event`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] if the effect could not be committed.
    fn apply<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), HandlerError>>;
}

/// Injectable failure hook consulted before the side effect runs.
///
/// Production wiring uses [`NeverFail`]; demos and tests inject policies that
/// fail on purpose to exercise dead-lettering.
pub trait FailurePolicy: Send + Sync {
    /// Return a reason to fail this event, or `None` to proceed.
    fn should_fail(&self, event: &Event) -> Option<String>;
}

/// Failure policy that never fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverFail;

impl FailurePolicy for NeverFail {
    fn should_fail(&self, _event: &Event) -> Option<String> {
        None
    }
}
