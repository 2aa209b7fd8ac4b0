pub mod event;
pub mod parse;
pub mod replay;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use self::event::FlowEvent;

/// Callback for decoded events.
pub type EventHandler = Box<dyn Fn(FlowEvent) + Send + Sync>;

/// Callback for source errors.
pub type ErrorHandler = Box<dyn Fn(anyhow::Error) + Send + Sync>;

/// Producer of per-segment TCP observations.
pub trait EventSource: Send {
    /// Begin delivering events to the registered handlers.
    fn start(
        &mut self,
        ctx: CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Stop delivering events and release the underlying input.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Register a handler for decoded events.
    fn on_event(&mut self, handler: EventHandler);

    /// Register a handler for source errors.
    fn on_error(&mut self, handler: ErrorHandler);
}
